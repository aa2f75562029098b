//! Domain events published to the host application.

use {
    serde::Serialize,
    tokio::sync::mpsc,
    tracing::trace,
};

use crate::{delivery::ChannelResult, types::RelevantMessage};

/// Why the connection stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFailure {
    LoggedOut,
    AttemptsExhausted,
}

/// Why a queued retry was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryFailure {
    /// Every allowed attempt failed.
    Exhausted,
    /// Untouched for longer than the staleness window.
    Stale,
    /// The channel reported a non-retryable failure on retry.
    Rejected,
    /// Still pending when shutdown finished its final pass.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchEvent {
    /// A group message passed validation and deduplication.
    MessageReceived {
        message_id: String,
        conversation_id: String,
    },
    MessageRelevant {
        message: RelevantMessage,
    },
    ConnectionReady,
    ConnectionFailed {
        reason: ConnectionFailure,
        attempts: u32,
    },
    /// The transport needs the user to scan a pairing code.
    CredentialRequired {
        qr: String,
    },
    DispatchCompleted {
        message_id: String,
        results: Vec<ChannelResult>,
    },
    RetrySuccess {
        message_id: String,
        channel: String,
        attempts: u32,
    },
    RetryFailed {
        message_id: String,
        channel: String,
        attempts: u32,
        reason: RetryFailure,
    },
}

impl WatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageReceived { .. } => "message:received",
            Self::MessageRelevant { .. } => "message:relevant",
            Self::ConnectionReady => "connection:ready",
            Self::ConnectionFailed { .. } => "connection:failed",
            Self::CredentialRequired { .. } => "credential:required",
            Self::DispatchCompleted { .. } => "dispatch:completed",
            Self::RetrySuccess { .. } => "retry:success",
            Self::RetryFailed { .. } => "retry:failed",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<WatchEvent>;

/// Publish an event; a dropped receiver is not an error for the sender.
pub fn emit(events: &EventSender, event: WatchEvent) {
    let name = event.name();
    if events.send(event).is_err() {
        trace!(event = name, "event receiver dropped");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let event = WatchEvent::RetryFailed {
            message_id: "m1".into(),
            channel: "telegram".into(),
            attempts: 3,
            reason: RetryFailure::Exhausted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "retry_failed");
        assert_eq!(json["reason"], "exhausted");
        assert_eq!(event.name(), "retry:failed");
    }

    #[test]
    fn emit_survives_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit(&tx, WatchEvent::ConnectionReady);
    }

    #[test]
    fn emit_delivers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        emit(&tx, WatchEvent::ConnectionReady);
        emit(&tx, WatchEvent::ConnectionFailed {
            reason: ConnectionFailure::LoggedOut,
            attempts: 0,
        });
        assert_eq!(rx.try_recv().unwrap().name(), "connection:ready");
        assert_eq!(rx.try_recv().unwrap().name(), "connection:failed");
    }
}
