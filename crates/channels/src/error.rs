use std::{error::Error as StdError, time::Duration};

use milesguard_common::{FailureReason, SendOutcome};

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed channel errors, each mapping to one [`FailureReason`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Channel is switched off or has no credentials.
    #[error("channel disabled: {message}")]
    Disabled { message: String },

    /// Channel configuration is rejected by the remote side.
    #[error("channel misconfigured: {message}")]
    Config { message: String },

    /// Remote side asked us to slow down.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("request timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// Network or filesystem failure.
    #[error("transport failure: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// Wrapped source error from an external dependency.
    #[error("channel operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn disabled(message: impl std::fmt::Display) -> Self {
        Self::Disabled {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transport(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Disabled { .. } => FailureReason::ServiceDisabled,
            Self::Config { .. } => FailureReason::ConfigError,
            Self::RateLimited { .. } => FailureReason::RateLimited,
            Self::Timeout { .. } => FailureReason::Timeout,
            Self::Transport { .. } => FailureReason::Transport,
            Self::External { .. } | Self::SerdeJson(_) => FailureReason::Other,
        }
    }

    /// Convert into the structured result reported to the dispatcher.
    pub fn into_outcome(self) -> SendOutcome {
        SendOutcome::failed(self.failure_reason(), self.to_string())
    }
}

/// Collapse a delivery result into a [`SendOutcome`].
pub fn to_outcome(result: Result<()>) -> SendOutcome {
    match result {
        Ok(()) => SendOutcome::delivered(),
        Err(e) => e.into_outcome(),
    }
}
