//! Wire-level types exchanged with the WhatsApp transport.
//!
//! Message payloads follow the Baileys `WAMessage` JSON shape (camelCase)
//! so the sidecar can forward them untouched.

use {
    chrono::{DateTime, TimeZone, Utc},
    milesguard_common::GroupInfo,
    serde::{Deserialize, Serialize},
};

/// Status code WhatsApp uses when the linked device was removed.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Link state reported by a connection update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Close,
}

/// Why the transport session closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
}

/// How the connection manager should react to a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Transient,
    LoggedOut,
    /// Another client took over the session.
    SessionConflict,
}

impl CloseReason {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Conflict wins over the status code: WhatsApp reports a replaced
    /// session with a conflict message regardless of the code it sends.
    pub fn classify(&self) -> CloseCause {
        if self.message.to_lowercase().contains("conflict") {
            CloseCause::SessionConflict
        } else if self.status_code == Some(LOGGED_OUT_STATUS) {
            CloseCause::LoggedOut
        } else {
            CloseCause::Transient
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<LinkState>,
    /// Pairing code to show the user, when the session has no credentials.
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl ConnectionUpdate {
    pub fn open() -> Self {
        Self {
            connection: Some(LinkState::Open),
            ..Self::default()
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self {
            connection: Some(LinkState::Close),
            close_reason: Some(reason),
            ..Self::default()
        }
    }

    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedText {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Captioned {
    #[serde(default)]
    pub caption: Option<String>,
}

/// The subset of a Baileys message body milesguard understands. Anything
/// else is kept as opaque JSON only so system frames can be recognized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default)]
    pub conversation: Option<String>,
    #[serde(default)]
    pub extended_text_message: Option<ExtendedText>,
    #[serde(default)]
    pub image_message: Option<Captioned>,
    #[serde(default)]
    pub video_message: Option<Captioned>,
    #[serde(default)]
    pub document_message: Option<Captioned>,
    #[serde(default)]
    pub quoted_message: Option<Box<MessageContent>>,
    #[serde(default)]
    pub protocol_message: Option<serde_json::Value>,
    #[serde(default)]
    pub sender_key_distribution_message: Option<serde_json::Value>,
    #[serde(default)]
    pub message_context_info: Option<serde_json::Value>,
}

impl MessageContent {
    /// First non-empty text part: plain body, extended text, media captions,
    /// then the quoted message.
    pub fn text(&self) -> Option<&str> {
        fn caption(c: &Option<Captioned>) -> Option<&str> {
            c.as_ref().and_then(|c| c.caption.as_deref())
        }
        [
            self.conversation.as_deref(),
            self.extended_text_message
                .as_ref()
                .and_then(|e| e.text.as_deref()),
            caption(&self.image_message),
            caption(&self.video_message),
            caption(&self.document_message),
        ]
        .into_iter()
        .flatten()
        .find(|t| !t.is_empty())
        .or_else(|| self.quoted_message.as_deref().and_then(Self::text))
    }

    pub fn is_protocol_frame(&self) -> bool {
        self.protocol_message.is_some()
            || self.sender_key_distribution_message.is_some()
            || self.message_context_info.is_some()
    }
}

/// An inbound message as delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default)]
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<MessageContent>,
}

impl RawMessage {
    pub fn id(&self) -> Option<&str> {
        self.key.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.key.remote_jid.as_deref().filter(|id| !id.is_empty())
    }

    pub fn is_group(&self) -> bool {
        self.conversation_id().is_some_and(is_group_id)
    }

    pub fn text(&self) -> Option<&str> {
        self.message.as_ref().and_then(MessageContent::text)
    }

    /// Protocol frames and messages without any readable text.
    pub fn is_system(&self) -> bool {
        match &self.message {
            None => true,
            Some(content) => {
                content.is_protocol_frame()
                    || content.text().is_none_or(|t| t.trim().is_empty())
            },
        }
    }

    /// Push name, else the participant's phone part, else `"Unknown"`.
    pub fn sender_name(&self) -> String {
        if let Some(name) = self.push_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        self.key
            .participant
            .as_deref()
            .and_then(|p| p.split('@').next())
            .filter(|p| !p.is_empty())
            .unwrap_or("Unknown")
            .to_string()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.message_timestamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
}

/// Group ids end in the `@g.us` server suffix.
pub fn is_group_id(id: &str) -> bool {
    id.contains("@g.us")
}

/// Partial group metadata change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupUpdate {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Option<usize>,
}

/// Everything a live transport session pushes to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionUpdate(ConnectionUpdate),
    MessageBatch(Vec<RawMessage>),
    GroupDeltas(Vec<GroupUpdate>),
    GroupUpserts(Vec<GroupInfo>),
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn raw(value: serde_json::Value) -> RawMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn close_classification() {
        assert_eq!(
            CloseReason::new(Some(401), "Connection Failure").classify(),
            CloseCause::LoggedOut
        );
        assert_eq!(
            CloseReason::new(Some(440), "Stream Errored (conflict)").classify(),
            CloseCause::SessionConflict
        );
        assert_eq!(
            CloseReason::new(Some(401), "conflict: replaced").classify(),
            CloseCause::SessionConflict
        );
        assert_eq!(
            CloseReason::new(Some(428), "Connection Closed").classify(),
            CloseCause::Transient
        );
        assert_eq!(CloseReason::default().classify(), CloseCause::Transient);
    }

    #[test]
    fn text_prefers_plain_body() {
        let msg = raw(json!({
            "key": {"remoteJid": "123@g.us", "id": "A1", "participant": "5511@s.whatsapp.net"},
            "pushName": "Ana",
            "messageTimestamp": 1_700_000_000,
            "message": {"conversation": "hello", "imageMessage": {"caption": "pic"}}
        }));
        assert_eq!(msg.text(), Some("hello"));
        assert_eq!(msg.id(), Some("A1"));
        assert!(msg.is_group());
        assert!(!msg.is_system());
        assert_eq!(msg.sender_name(), "Ana");
        assert_eq!(msg.timestamp().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn text_falls_back_through_captions_and_quotes() {
        let msg = raw(json!({"message": {"extendedTextMessage": {"text": "ext"}}}));
        assert_eq!(msg.text(), Some("ext"));

        let msg = raw(json!({"message": {"videoMessage": {"caption": "clip"}}}));
        assert_eq!(msg.text(), Some("clip"));

        let msg = raw(json!({"message": {"documentMessage": {"caption": "doc"}}}));
        assert_eq!(msg.text(), Some("doc"));

        let msg = raw(json!({"message": {"quotedMessage": {"conversation": "quoted"}}}));
        assert_eq!(msg.text(), Some("quoted"));
    }

    #[test]
    fn system_messages() {
        assert!(raw(json!({})).is_system());
        assert!(raw(json!({"message": {"protocolMessage": {"type": 0}}})).is_system());
        assert!(raw(json!({"message": {"senderKeyDistributionMessage": {}}})).is_system());
        assert!(
            raw(json!({"message": {"conversation": "hi", "messageContextInfo": {}}})).is_system()
        );
        assert!(raw(json!({"message": {"conversation": "   "}})).is_system());
    }

    #[test]
    fn sender_name_fallbacks() {
        let msg = raw(json!({"key": {"participant": "5511999@s.whatsapp.net"}}));
        assert_eq!(msg.sender_name(), "5511999");
        assert_eq!(raw(json!({})).sender_name(), "Unknown");
    }

    #[test]
    fn direct_chats_are_not_groups() {
        let msg = raw(json!({"key": {"remoteJid": "5511@s.whatsapp.net"}}));
        assert!(!msg.is_group());
        assert!(is_group_id("120363@g.us"));
    }
}
