//! Semantic validation of a loaded configuration.
//!
//! Errors make the watcher refuse to start; warnings describe setups that run
//! but probably do not do what the operator intended.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use crate::schema::MilesguardConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "required", "range", "channel", "retry", "duplicate"
    pub category: &'static str,
    /// Dotted path, e.g. "dispatch.max_attempts"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

struct Collector(Vec<Diagnostic>);

impl Collector {
    fn push(
        &mut self,
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.0.push(Diagnostic {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        });
    }

    fn error(&mut self, category: &'static str, path: impl Into<String>, msg: impl Into<String>) {
        self.push(Severity::Error, category, path, msg);
    }

    fn warning(&mut self, category: &'static str, path: impl Into<String>, msg: impl Into<String>) {
        self.push(Severity::Warning, category, path, msg);
    }

    fn range<T: PartialOrd + std::fmt::Display>(
        &mut self,
        path: &str,
        value: T,
        min: T,
        max: T,
    ) {
        if value < min || value > max {
            self.error(
                "range",
                path,
                format!("{value} is outside the allowed range {min}..={max}"),
            );
        }
    }

    fn non_zero(&mut self, path: &str, value: u64) {
        if value == 0 {
            self.error("range", path, "must be greater than zero");
        }
    }
}

/// Validate a loaded configuration.
#[must_use]
pub fn validate(config: &MilesguardConfig, config_path: Option<PathBuf>) -> ValidationResult {
    let mut out = Collector(Vec::new());

    check_filter(config, &mut out);
    check_whatsapp(config, &mut out);
    check_dedup(config, &mut out);
    check_dispatch(config, &mut out);
    check_channels(config, &mut out);

    if config.status_log_interval_secs == Some(0) {
        out.error(
            "range",
            "status_log_interval_secs",
            "must be greater than zero when set",
        );
    }

    let mut diagnostics = out.0;
    diagnostics.sort_by_key(|d| d.severity);
    ValidationResult {
        diagnostics,
        config_path,
    }
}

fn check_filter(config: &MilesguardConfig, out: &mut Collector) {
    let filter = &config.filter;
    for (field, values) in [
        ("target_groups", &filter.target_groups),
        ("keywords", &filter.keywords),
    ] {
        if values.is_empty() {
            out.error(
                "required",
                format!("filter.{field}"),
                format!("at least one entry is required in filter.{field}"),
            );
        }
        let mut seen = HashSet::new();
        for (i, value) in values.iter().enumerate() {
            if value.trim().is_empty() {
                out.error("required", format!("filter.{field}[{i}]"), "entry is blank");
                continue;
            }
            if !seen.insert(value.trim().to_lowercase()) {
                out.warning(
                    "duplicate",
                    format!("filter.{field}[{i}]"),
                    format!("\"{value}\" is listed more than once"),
                );
            }
        }
    }
}

fn check_whatsapp(config: &MilesguardConfig, out: &mut Collector) {
    let wa = &config.whatsapp;
    out.range("whatsapp.reconnect_attempts", wa.reconnect_attempts, 1, 10);
    out.range(
        "whatsapp.reconnect_base_delay_ms",
        wa.reconnect_base_delay_ms,
        1_000,
        60_000,
    );
    if wa.reconnect_max_delay_ms < wa.reconnect_base_delay_ms {
        out.error(
            "range",
            "whatsapp.reconnect_max_delay_ms",
            "must not be smaller than whatsapp.reconnect_base_delay_ms",
        );
    }
    out.non_zero("whatsapp.request_timeout_secs", wa.request_timeout_secs);
    if wa.sidecar_port == 0 {
        out.error("range", "whatsapp.sidecar_port", "port 0 is not usable");
    }
}

fn check_dedup(config: &MilesguardConfig, out: &mut Collector) {
    let dedup = &config.dedup;
    out.non_zero("dedup.ttl_secs", dedup.ttl_secs);
    out.non_zero("dedup.sweep_interval_secs", dedup.sweep_interval_secs);
    out.non_zero("dedup.bucket_secs", dedup.bucket_secs);
    if dedup.text_prefix_chars == 0 {
        out.error("range", "dedup.text_prefix_chars", "must be greater than zero");
    }
    if dedup.ttl_secs > 0 && dedup.ttl_secs < dedup.bucket_secs {
        out.warning(
            "range",
            "dedup.ttl_secs",
            "entries expire before their time bucket closes; retransmissions may be delivered twice",
        );
    }
}

fn check_dispatch(config: &MilesguardConfig, out: &mut Collector) {
    let dispatch = &config.dispatch;
    if dispatch.max_attempts == 0 {
        out.error("range", "dispatch.max_attempts", "must be at least 1");
    }
    out.non_zero("dispatch.scan_interval_ms", dispatch.scan_interval_ms);
    out.non_zero("dispatch.stale_after_secs", dispatch.stale_after_secs);

    // The longest wait is before the final attempt: base * 2^(max - 2),
    // observed up to one scan interval late.
    if dispatch.max_attempts >= 2 && dispatch.stale_after_secs > 0 {
        let exponent = dispatch.max_attempts - 2;
        let longest_gap = 2u32
            .checked_pow(exponent)
            .and_then(|factor| dispatch.retry_base_delay().checked_mul(factor))
            .unwrap_or(Duration::MAX)
            .saturating_add(dispatch.scan_interval());
        if longest_gap > dispatch.stale_after() {
            out.warning(
                "retry",
                "dispatch.stale_after_secs",
                format!(
                    "the final retry waits up to {}s, longer than the {}s staleness window; \
                     late retries will be purged instead of attempted",
                    longest_gap.as_secs(),
                    dispatch.stale_after_secs
                ),
            );
        }
    }
}

fn check_channels(config: &MilesguardConfig, out: &mut Collector) {
    let channels = &config.channels;
    let telegram = &channels.telegram;
    out.range(
        "channels.telegram.rate_limit_per_minute",
        telegram.rate_limit_per_minute,
        1,
        60,
    );
    out.non_zero(
        "channels.telegram.request_timeout_secs",
        telegram.request_timeout_secs,
    );

    if !channels.enabled {
        out.warning(
            "channel",
            "channels.enabled",
            "notification delivery is switched off; relevant messages are only logged",
        );
        return;
    }
    if !telegram.enabled && !channels.file.enabled {
        out.warning("channel", "channels", "no notification channel is enabled");
    }
    if telegram.enabled && !telegram.has_token() {
        out.warning(
            "channel",
            "channels.telegram.token",
            "telegram is enabled without a bot token; it will report service_disabled",
        );
    }
    if telegram.enabled && !telegram.has_chat_id() {
        out.warning(
            "channel",
            "channels.telegram.chat_id",
            "telegram is enabled without a chat id; it will report service_disabled",
        );
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::Secret};

    fn valid() -> MilesguardConfig {
        let mut cfg = MilesguardConfig::default();
        cfg.filter.target_groups = vec!["Southern Flights".into()];
        cfg.filter.keywords = vec!["bonus".into(), "100%".into()];
        cfg.channels.telegram.token = Secret::new("123:abc".into());
        cfg.channels.telegram.chat_id = Some("-100".into());
        cfg
    }

    fn paths(result: &ValidationResult, severity: Severity) -> Vec<String> {
        result
            .diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .map(|d| d.path.clone())
            .collect()
    }

    #[test]
    fn complete_config_has_no_diagnostics() {
        let result = validate(&valid(), None);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn empty_filter_lists_are_errors() {
        let result = validate(&MilesguardConfig::default(), None);
        assert!(result.has_errors());
        let errors = paths(&result, Severity::Error);
        assert!(errors.contains(&"filter.target_groups".to_string()));
        assert!(errors.contains(&"filter.keywords".to_string()));
    }

    #[test]
    fn blank_keyword_is_error() {
        let mut cfg = valid();
        cfg.filter.keywords.push("   ".into());
        let result = validate(&cfg, None);
        assert_eq!(paths(&result, Severity::Error), vec!["filter.keywords[2]"]);
    }

    #[test]
    fn duplicate_keyword_warns() {
        let mut cfg = valid();
        cfg.filter.keywords.push("BONUS".into());
        let result = validate(&cfg, None);
        assert!(!result.has_errors());
        assert_eq!(paths(&result, Severity::Warning), vec!["filter.keywords[2]"]);
    }

    #[test]
    fn reconnect_ranges_enforced() {
        let mut cfg = valid();
        cfg.whatsapp.reconnect_attempts = 11;
        cfg.whatsapp.reconnect_base_delay_ms = 500;
        let errors = paths(&validate(&cfg, None), Severity::Error);
        assert!(errors.contains(&"whatsapp.reconnect_attempts".to_string()));
        assert!(errors.contains(&"whatsapp.reconnect_base_delay_ms".to_string()));
    }

    #[test]
    fn rate_limit_range_enforced() {
        let mut cfg = valid();
        cfg.channels.telegram.rate_limit_per_minute = 0;
        let errors = paths(&validate(&cfg, None), Severity::Error);
        assert_eq!(errors, vec!["channels.telegram.rate_limit_per_minute"]);
    }

    #[test]
    fn zero_max_attempts_is_error() {
        let mut cfg = valid();
        cfg.dispatch.max_attempts = 0;
        assert!(validate(&cfg, None).has_errors());
    }

    #[test]
    fn missing_telegram_credentials_warn() {
        let mut cfg = valid();
        cfg.channels.telegram.token = Secret::new(String::new());
        cfg.channels.telegram.chat_id = None;
        let result = validate(&cfg, None);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 2);
    }

    #[test]
    fn backoff_past_staleness_window_warns() {
        let mut cfg = valid();
        cfg.dispatch.max_attempts = 8;
        let warnings = paths(&validate(&cfg, None), Severity::Warning);
        assert_eq!(warnings, vec!["dispatch.stale_after_secs"]);
    }

    #[test]
    fn errors_sort_before_warnings() {
        let mut cfg = valid();
        cfg.channels.telegram.chat_id = None;
        cfg.dispatch.max_attempts = 0;
        let result = validate(&cfg, None);
        assert_eq!(result.diagnostics[0].severity, Severity::Error);
    }
}
