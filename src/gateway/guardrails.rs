use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::GatewayError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default)]
    pub banned_phrases: Vec<String>,
    #[serde(default)]
    pub banned_regexes: Vec<String>,
    /// Reject inline scripts, `javascript:`/`data:text/html` URLs, HTML event
    /// handlers and executable file names.
    #[serde(default)]
    pub block_active_content: bool,
}

fn default_max_message_chars() -> usize {
    4_000
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            banned_phrases: Vec::new(),
            banned_regexes: Vec::new(),
            block_active_content: false,
        }
    }
}

impl GuardrailsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_message_chars == 0 {
            return Err("guardrails.max_message_chars must be > 0".to_string());
        }
        compile_banned_regexes(&self.banned_regexes)?;
        Ok(())
    }
}

fn compile_banned_regexes(raw: &[String]) -> Result<Vec<(String, Regex)>, String> {
    raw.iter()
        .map(|raw| raw.trim())
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|regex| (pattern.to_string(), regex))
                .map_err(|err| format!("invalid banned_regex {pattern}: {err}"))
        })
        .collect()
}

/// Content checks with banned patterns compiled once.
#[derive(Clone, Debug)]
pub struct Guardrails {
    max_message_chars: usize,
    banned_phrases: Vec<(String, String)>,
    banned_regexes: Vec<(String, Regex)>,
    block_active_content: bool,
}

impl Guardrails {
    pub fn compile(config: &GuardrailsConfig) -> Result<Self, String> {
        config.validate()?;
        let banned_phrases = config
            .banned_phrases
            .iter()
            .map(|phrase| phrase.trim())
            .filter(|phrase| !phrase.is_empty())
            .map(|phrase| (phrase.to_string(), phrase.to_lowercase()))
            .collect();
        Ok(Self {
            max_message_chars: config.max_message_chars,
            banned_phrases,
            banned_regexes: compile_banned_regexes(&config.banned_regexes)?,
            block_active_content: config.block_active_content,
        })
    }

    pub fn check(&self, text: &str) -> Result<(), GatewayError> {
        match self.check_text(text) {
            Some(reason) => Err(GatewayError::ContentRejected { reason }),
            None => Ok(()),
        }
    }

    pub fn check_text(&self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return Some("empty_message".to_string());
        }

        let chars = text.chars().count();
        if chars > self.max_message_chars {
            return Some(format!("message_too_long:{chars}>{}", self.max_message_chars));
        }

        if !self.banned_phrases.is_empty() {
            let content = text.to_lowercase();
            for (phrase, lowered) in &self.banned_phrases {
                if content.contains(lowered.as_str()) {
                    return Some(format!("banned_phrase:{phrase}"));
                }
            }
        }

        for (pattern, regex) in &self.banned_regexes {
            if regex.is_match(text) {
                return Some(format!("banned_regex:{pattern}"));
            }
        }

        if self.block_active_content && active_content_regex().is_match(text) {
            return Some("active_content".to_string());
        }

        None
    }
}

fn active_content_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        RegexBuilder::new(
            r"<script|javascript:|data:text/html|\bon[a-z]+\s*=|\.(exe|bat)\b|\.sh\s",
        )
        .case_insensitive(true)
        .build()
        .expect("active content regex is valid")
    })
}
