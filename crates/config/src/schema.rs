//! Config schema types (filter, whatsapp, dedup, dispatch, channels).
use std::{path::PathBuf, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MilesguardConfig {
    pub filter: FilterConfig,
    pub whatsapp: WhatsAppConfig,
    pub dedup: DedupConfig,
    pub dispatch: DispatchConfig,
    pub channels: ChannelsConfig,
    /// Emit a status line at this interval when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_log_interval_secs: Option<u64>,
}

/// Which conversations are watched and which words make a message relevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Community label, informational only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community: Option<String>,
    pub target_groups: Vec<String>,
    pub keywords: Vec<String>,
    /// Match keywords exactly instead of folding case and diacritics.
    pub case_sensitive: bool,
    /// Match group names exactly instead of case-insensitively.
    pub group_case_sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub session_dir: PathBuf,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Pause before reconnecting after a session conflict.
    pub conflict_retry_delay_ms: u64,
    /// Delay between the connection opening and the group roster fetch.
    pub roster_fetch_delay_ms: u64,
    pub sidecar_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_dir: Option<PathBuf>,
    pub auto_start_sidecar: bool,
    pub request_timeout_secs: u64,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("./sessions"),
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 5_000,
            reconnect_max_delay_ms: 30_000,
            conflict_retry_delay_ms: 2_000,
            roster_fetch_delay_ms: 2_000,
            sidecar_port: 18790,
            sidecar_dir: None,
            auto_start_sidecar: true,
            request_timeout_secs: 60,
        }
    }
}

impl WhatsAppConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn conflict_retry_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_delay_ms)
    }

    pub fn roster_fetch_delay(&self) -> Duration {
        Duration::from_millis(self.roster_fetch_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Characters of message text that feed the fingerprint.
    pub text_prefix_chars: usize,
    /// Width of the fingerprint time bucket.
    pub bucket_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            sweep_interval_secs: 1_800,
            text_prefix_chars: 100,
            bucket_secs: 60,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub scan_interval_ms: u64,
    /// Retry items untouched for longer than this are purged.
    pub stale_after_secs: u64,
    /// Upper bound on the final retry pass during shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 5_000,
            scan_interval_ms: 10_000,
            stale_after_secs: 300,
            shutdown_timeout_secs: 10,
        }
    }
}

impl DispatchConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Master switch for all notification delivery.
    pub enabled: bool,
    pub telegram: TelegramConfig,
    pub file: FileLogConfig,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram: TelegramConfig::default(),
            file: FileLogConfig::default(),
        }
    }
}

/// Telegram bot used for notifications.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,
    /// Numeric chat id or `@channel` username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
}

impl TelegramConfig {
    pub fn has_token(&self) -> bool {
        !self.token.expose_secret().trim().is_empty()
    }

    pub fn has_chat_id(&self) -> bool {
        self.chat_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("enabled", &self.enabled)
            .field("token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish_non_exhaustive()
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: Secret::new(String::new()),
            chat_id: None,
            rate_limit_per_minute: 30,
            request_timeout_secs: 30,
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Append-only JSON-lines log of relevant messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogConfig {
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./logs/messages"),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MilesguardConfig::default();
        assert_eq!(cfg.whatsapp.reconnect_attempts, 5);
        assert_eq!(cfg.whatsapp.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(cfg.whatsapp.reconnect_max_delay(), Duration::from_secs(30));
        assert_eq!(cfg.dedup.ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.dedup.sweep_interval(), Duration::from_secs(1800));
        assert_eq!(cfg.dispatch.max_attempts, 3);
        assert_eq!(cfg.dispatch.scan_interval(), Duration::from_secs(10));
        assert_eq!(cfg.dispatch.stale_after(), Duration::from_secs(300));
        assert_eq!(cfg.channels.telegram.rate_limit_per_minute, 30);
        assert!(cfg.channels.enabled);
        assert!(!cfg.filter.case_sensitive);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: MilesguardConfig = toml::from_str(
            r#"
            [filter]
            target_groups = ["Southern Flights"]
            keywords = ["bonus"]

            [dispatch]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.filter.target_groups, vec!["Southern Flights"]);
        assert_eq!(cfg.dispatch.max_attempts, 5);
        assert_eq!(cfg.dispatch.retry_base_delay_ms, 5_000);
        assert_eq!(cfg.whatsapp.session_dir, PathBuf::from("./sessions"));
    }

    #[test]
    fn debug_redacts_token() {
        let telegram = TelegramConfig {
            token: Secret::new("123:SECRET".into()),
            ..Default::default()
        };
        let rendered = format!("{telegram:?}");
        assert!(!rendered.contains("SECRET"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn blank_credentials_are_missing() {
        let telegram = TelegramConfig {
            token: Secret::new("  ".into()),
            chat_id: Some(String::new()),
            ..Default::default()
        };
        assert!(!telegram.has_token());
        assert!(!telegram.has_chat_id());
    }

    #[test]
    fn token_survives_serialization() {
        let cfg = TelegramConfig {
            token: Secret::new("tok".into()),
            chat_id: Some("-100".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TelegramConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.token.expose_secret(), "tok");
        assert_eq!(back.chat_id.as_deref(), Some("-100"));
    }
}
