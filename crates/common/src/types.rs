use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

/// Display name used when a group has no subject.
pub const UNKNOWN_GROUP_NAME: &str = "Unknown group";

/// An inbound message after transport-specific decoding.
///
/// Built once by the orchestrator and never mutated afterwards; stage two
/// produces a copy carrying the resolved conversation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_name: Option<String>,
    pub sender_name: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl NormalizedMessage {
    #[must_use]
    pub fn with_conversation_name(mut self, name: impl Into<String>) -> Self {
        self.conversation_name = Some(name.into());
        self
    }

    /// Resolved conversation name, or an empty string before resolution.
    pub fn conversation_name(&self) -> &str {
        self.conversation_name.as_deref().unwrap_or_default()
    }
}

/// A message that passed the filter, with the keywords that matched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevantMessage {
    #[serde(flatten)]
    pub message: NormalizedMessage,
    pub matched_keywords: Vec<String>,
    pub is_relevant: bool,
}

impl RelevantMessage {
    pub fn new(message: NormalizedMessage, matched_keywords: Vec<String>) -> Self {
        Self {
            message,
            matched_keywords,
            is_relevant: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }
}

/// Group metadata as tracked by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: usize,
}

impl GroupInfo {
    pub fn display_name(&self) -> &str {
        match self.subject.as_deref() {
            Some(subject) if !subject.trim().is_empty() => subject,
            _ => UNKNOWN_GROUP_NAME,
        }
    }
}
