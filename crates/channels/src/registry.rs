use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::NotificationChannel;

/// Ordered set of notification channels, unique by name.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel; a channel with the same name replaces the old one.
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        if let Some(slot) = self.channels.iter_mut().find(|c| c.name() == channel.name()) {
            warn!(channel = channel.name(), "replacing registered channel");
            *slot = channel;
            return;
        }
        debug!(
            channel = channel.name(),
            enabled = channel.is_enabled(),
            "channel registered"
        );
        self.channels.push(channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.iter().find(|c| c.name() == name).cloned()
    }

    /// Channels currently accepting notifications, in registration order.
    pub fn enabled(&self) -> Vec<Arc<dyn NotificationChannel>> {
        self.channels
            .iter()
            .filter(|c| c.is_enabled())
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        milesguard_common::{NormalizedMessage, RelevantMessage, SendOutcome},
    };

    struct Stub {
        name: &'static str,
        enabled: bool,
        outcome: SendOutcome,
    }

    #[async_trait]
    impl NotificationChannel for Stub {
        fn name(&self) -> &str {
            self.name
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn send_notification(&self, _message: &RelevantMessage) -> SendOutcome {
            self.outcome.clone()
        }
    }

    fn stub(name: &'static str, enabled: bool) -> Arc<dyn NotificationChannel> {
        Arc::new(Stub {
            name,
            enabled,
            outcome: SendOutcome::delivered(),
        })
    }

    #[test]
    fn enabled_preserves_registration_order() {
        let mut registry = ChannelRegistry::new();
        registry.register(stub("telegram", true));
        registry.register(stub("file", false));
        registry.register(stub("webhook", true));
        assert_eq!(registry.names(), vec!["telegram", "file", "webhook"]);
        let enabled: Vec<String> = registry
            .enabled()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(enabled, vec!["telegram", "webhook"]);
    }

    #[test]
    fn same_name_replaces() {
        let mut registry = ChannelRegistry::new();
        registry.register(stub("telegram", false));
        registry.register(stub("telegram", true));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("telegram").is_some_and(|c| c.is_enabled()));
    }

    #[tokio::test]
    async fn lookup_and_send() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(Stub {
            name: "file",
            enabled: true,
            outcome: SendOutcome::disabled("off"),
        }));
        let message = RelevantMessage::new(
            NormalizedMessage {
                id: "m1".into(),
                conversation_id: "1@g.us".into(),
                conversation_name: Some("Southern Flights".into()),
                sender_name: "Ana".into(),
                text: "bonus".into(),
                received_at: chrono::Utc::now(),
            },
            vec!["bonus".into()],
        );
        let channel = registry.get("file").unwrap();
        let outcome = channel.send_notification(&message).await;
        assert!(!outcome.success);
        assert!(!outcome.is_retryable());
    }
}
