use {
    async_trait::async_trait,
    milesguard_common::{RelevantMessage, SendOutcome},
};

/// A downstream delivery mechanism for relevant messages.
///
/// Implementations never return errors: every failure is folded into the
/// [`SendOutcome`], labelled `service_disabled` or `config_error` when a
/// retry cannot help. Each implementation enforces its own request timeout.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable channel name, used as the retry-queue key.
    fn name(&self) -> &str;

    /// Disabled channels are skipped by the dispatcher.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn send_notification(&self, message: &RelevantMessage) -> SendOutcome;
}
