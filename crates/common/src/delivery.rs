//! Result shape every notification channel reports back to the dispatcher.

use serde::{Deserialize, Serialize};

/// Why a channel could not deliver a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The channel is switched off or missing credentials.
    ServiceDisabled,
    /// The channel is misconfigured in a way retrying cannot fix.
    ConfigError,
    RateLimited,
    Transport,
    Timeout,
    Other,
}

impl FailureReason {
    /// Only `service_disabled` and `config_error` are final.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::ServiceDisabled | Self::ConfigError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceDisabled => "service_disabled",
            Self::ConfigError => "config_error",
            Self::RateLimited => "rate_limited",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single `send_notification` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    #[must_use]
    pub fn delivered() -> Self {
        Self {
            success: true,
            reason: None,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn disabled(error: impl Into<String>) -> Self {
        Self::failed(FailureReason::ServiceDisabled, error)
    }

    /// A failure without a reason is treated as retryable.
    pub fn is_retryable(&self) -> bool {
        !self.success && self.reason.is_none_or(FailureReason::is_retryable)
    }
}

/// One channel's outcome within a dispatch fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub channel: String,
    #[serde(flatten)]
    pub outcome: SendOutcome,
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disabled_and_config_are_final() {
        assert!(!FailureReason::ServiceDisabled.is_retryable());
        assert!(!FailureReason::ConfigError.is_retryable());
        for reason in [
            FailureReason::RateLimited,
            FailureReason::Transport,
            FailureReason::Timeout,
            FailureReason::Other,
        ] {
            assert!(reason.is_retryable(), "{reason} should be retryable");
        }
    }

    #[test]
    fn unlabelled_failure_is_retryable() {
        let outcome = SendOutcome {
            success: false,
            reason: None,
            error: Some("socket closed".into()),
        };
        assert!(outcome.is_retryable());
        assert!(!SendOutcome::delivered().is_retryable());
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_string(&SendOutcome::disabled("no token")).unwrap();
        assert_eq!(
            json,
            r#"{"success":false,"reason":"service_disabled","error":"no token"}"#
        );
    }
}
