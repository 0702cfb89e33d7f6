use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Model,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub role: Role,
    pub text: String,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_prompt_char_budget")]
    pub prompt_char_budget: usize,
}

fn default_max_history() -> usize {
    10
}

fn default_prompt_char_budget() -> usize {
    16_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            prompt_char_budget: default_prompt_char_budget(),
        }
    }
}

/// History to send upstream plus the new message, which is carried apart
/// from the history budget.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub history: Vec<ContextEntry>,
    pub message: String,
}

impl Prompt {
    pub fn history_chars(&self) -> usize {
        self.history
            .iter()
            .map(|entry| entry.text.chars().count())
            .sum()
    }
}

/// Per-subject history counts, as reported by `Gateway::context_stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub total: usize,
    pub caller: usize,
    pub model: usize,
    pub first_at_ms: Option<u64>,
    pub last_at_ms: Option<u64>,
}

/// Per-subject conversation history, capped at `max_history` entries.
///
/// A subject with no map entry has not been loaded yet; callers that persist
/// history fill it with `restore` before reading.
#[derive(Debug, Default)]
pub struct ConversationContext {
    config: ContextConfig,
    conversations: Mutex<HashMap<String, VecDeque<ContextEntry>>>,
}

impl ConversationContext {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Newest entries first until the next one would exceed the character
    /// budget; that entry and everything older are left out.
    pub fn build_prompt(&self, subject: &str, message: &str) -> Prompt {
        let conversations = self.lock();
        let mut history = Vec::new();
        if let Some(entries) = conversations.get(subject) {
            let mut used = 0usize;
            for entry in entries.iter().rev() {
                let chars = entry.text.chars().count();
                if used.saturating_add(chars) > self.config.prompt_char_budget {
                    break;
                }
                used += chars;
                history.push(entry.clone());
            }
        }
        history.reverse();
        Prompt {
            history,
            message: message.to_string(),
        }
    }

    pub fn append(&self, subject: &str, role: Role, text: &str, timestamp_ms: u64) {
        let mut conversations = self.lock();
        let entries = conversations.entry(subject.to_string()).or_default();
        entries.push_back(ContextEntry {
            role,
            text: text.to_string(),
            timestamp_ms,
        });
        while entries.len() > self.config.max_history {
            entries.pop_front();
        }
    }

    /// Record a completed caller/model turn pair.
    pub fn append_exchange(
        &self,
        subject: &str,
        caller_text: &str,
        model_text: &str,
        at_ms: u64,
    ) {
        self.append(subject, Role::Caller, caller_text, at_ms);
        self.append(subject, Role::Model, model_text, at_ms);
    }

    pub fn is_loaded(&self, subject: &str) -> bool {
        self.lock().contains_key(subject)
    }

    /// Install persisted history for a subject that has not been loaded yet.
    /// Returns false and leaves the map alone if the subject is already present.
    pub fn restore(&self, subject: &str, entries: Vec<ContextEntry>) -> bool {
        let mut conversations = self.lock();
        if conversations.contains_key(subject) {
            return false;
        }
        let skip = entries.len().saturating_sub(self.config.max_history);
        conversations.insert(subject.to_string(), entries.into_iter().skip(skip).collect());
        true
    }

    pub fn stats(&self, subject: &str) -> ContextStats {
        let conversations = self.lock();
        let Some(entries) = conversations.get(subject) else {
            return ContextStats::default();
        };
        let caller = entries
            .iter()
            .filter(|entry| entry.role == Role::Caller)
            .count();
        ContextStats {
            total: entries.len(),
            caller,
            model: entries.len() - caller,
            first_at_ms: entries.front().map(|entry| entry.timestamp_ms),
            last_at_ms: entries.back().map(|entry| entry.timestamp_ms),
        }
    }

    pub fn entries(&self, subject: &str) -> Vec<ContextEntry> {
        self.lock()
            .get(subject)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, subject: &str) -> usize {
        self.lock().get(subject).map_or(0, VecDeque::len)
    }

    pub fn clear(&self, subject: &str) -> bool {
        self.lock().remove(subject).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ContextEntry>>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
