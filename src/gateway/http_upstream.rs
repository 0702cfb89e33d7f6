use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::context::{Prompt, Role};
use super::costing::{ModelTier, TierTable};
use super::{Upstream, UpstreamError, UpstreamReply};

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Upstream speaking the OpenAI `chat/completions` wire format. The model
/// name comes from the tier table.
#[derive(Clone)]
pub struct OpenAiCompatibleUpstream {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    tiers: TierTable,
    system_prompt: Option<String>,
}

impl std::fmt::Debug for OpenAiCompatibleUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleUpstream")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("tiers", &self.tiers)
            .field("system_prompt", &self.system_prompt.is_some())
            .finish()
    }
}

impl OpenAiCompatibleUpstream {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, tiers: TierTable) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("reqwest client build should not fail");
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            tiers,
            system_prompt: None,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, tier: ModelTier, prompt: &Prompt) -> serde_json::Value {
        let mut messages = Vec::with_capacity(prompt.history.len() + 2);
        if let Some(system) = self.system_prompt.as_deref() {
            messages.push(json!({"role": "system", "content": system}));
        }
        for entry in &prompt.history {
            let role = match entry.role {
                Role::Caller => "user",
                Role::Model => "assistant",
            };
            messages.push(json!({"role": role, "content": entry.text}));
        }
        messages.push(json!({"role": "user", "content": prompt.message}));
        json!({
            "model": self.tiers.model_name(tier),
            "messages": messages,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

/// Rough token count used when the upstream omits usage.
fn approx_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

fn truncate_chars(text: &str, max: usize) -> String {
    let mut out: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        out.push_str("...(truncated)");
    }
    out
}

#[async_trait]
impl Upstream for OpenAiCompatibleUpstream {
    async fn invoke(
        &self,
        tier: ModelTier,
        prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError> {
        let body = self.request_body(tier, prompt);
        let mut req = self.http.post(self.chat_completions_url());
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|err| UpstreamError::new(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!(
                "upstream returned {status}: {}",
                truncate_chars(&text, MAX_ERROR_BODY_CHARS)
            );
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(if retryable {
                UpstreamError::new(message)
            } else {
                UpstreamError::permanent(message)
            });
        }

        let parsed = response
            .json::<ChatCompletionsResponse>()
            .await
            .map_err(|err| UpstreamError::new(format!("invalid response body: {err}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| UpstreamError::new("chat/completions response has no content"))?;

        let prompt_chars: String = prompt
            .history
            .iter()
            .map(|entry| entry.text.as_str())
            .chain(std::iter::once(prompt.message.as_str()))
            .collect();
        let usage = parsed.usage.as_ref();
        let input_tokens = usage
            .and_then(|usage| usage.prompt_tokens)
            .unwrap_or_else(|| approx_tokens(&prompt_chars));
        let output_tokens = usage
            .and_then(|usage| usage.completion_tokens)
            .unwrap_or_else(|| approx_tokens(&text));

        Ok(UpstreamReply {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::context::ContextEntry;

    #[test]
    fn request_maps_history_roles_and_tier_model() {
        let upstream = OpenAiCompatibleUpstream::new("http://localhost/v1/", "", TierTable::default())
            .with_system_prompt("be brief");
        let prompt = Prompt {
            history: vec![
                ContextEntry {
                    role: Role::Caller,
                    text: "q1".to_string(),
                    timestamp_ms: 1,
                },
                ContextEntry {
                    role: Role::Model,
                    text: "a1".to_string(),
                    timestamp_ms: 1,
                },
            ],
            message: "q2".to_string(),
        };
        let body = upstream.request_body(ModelTier::High, &prompt);
        assert_eq!(body["model"], "gemini-2.5-pro");
        let roles: Vec<_> = body["messages"]
            .as_array()
            .expect("messages")
            .iter()
            .map(|message| message["role"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(body["messages"][3]["content"], "q2");
        assert_eq!(
            upstream.chat_completions_url(),
            "http://localhost/v1/chat/completions"
        );
    }

    #[test]
    fn approximates_tokens_by_characters() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    #[test]
    fn debug_redacts_api_key() {
        let upstream = OpenAiCompatibleUpstream::new("http://x", "sk-secret", TierTable::default());
        assert!(!format!("{upstream:?}").contains("sk-secret"));
    }
}
