use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    secrecy::Secret,
    tracing::{debug, error, info, warn},
};

use crate::{
    env_subst::substitute_env,
    schema::MilesguardConfig,
    validate::{Severity, validate},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "milesguard.toml",
    "milesguard.yaml",
    "milesguard.yml",
    "milesguard.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<MilesguardConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./milesguard.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/milesguard/milesguard.{toml,yaml,yml,json}` (user-global)
///
/// Target groups and keywords have no sensible defaults, so a missing file
/// is an error.
pub fn discover_and_load() -> anyhow::Result<(MilesguardConfig, PathBuf)> {
    let Some(path) = find_config_file() else {
        anyhow::bail!(
            "no config file found; create ./milesguard.toml or {}",
            config_dir()
                .map(|d| d.join("milesguard.toml").display().to_string())
                .unwrap_or_else(|| "~/.config/milesguard/milesguard.toml".into())
        );
    };
    debug!(path = %path.display(), "loading config");
    let cfg = load_config(&path)?;
    Ok((cfg, path))
}

/// Load from `explicit` or discovered locations, apply environment
/// overrides, and validate. Warnings are logged; errors abort the load.
pub fn load_runtime_config(explicit: Option<&Path>) -> anyhow::Result<MilesguardConfig> {
    let (mut cfg, path) = match explicit {
        Some(path) => (load_config(path)?, path.to_path_buf()),
        None => discover_and_load()?,
    };
    apply_env_overrides(&mut cfg);

    let result = validate(&cfg, Some(path.clone()));
    for diag in &result.diagnostics {
        match diag.severity {
            Severity::Error => {
                error!(path = %diag.path, category = diag.category, "{}", diag.message)
            },
            Severity::Warning => {
                warn!(path = %diag.path, category = diag.category, "{}", diag.message)
            },
            Severity::Info => {
                info!(path = %diag.path, category = diag.category, "{}", diag.message)
            },
        }
    }
    if result.has_errors() {
        anyhow::bail!(
            "{} has {} configuration error(s)",
            path.display(),
            result.count(Severity::Error)
        );
    }

    info!(
        path = %path.display(),
        target_groups = cfg.filter.target_groups.len(),
        keywords = cfg.filter.keywords.len(),
        "config loaded"
    );
    Ok(cfg)
}

/// Apply process environment overrides on top of file values.
pub fn apply_env_overrides(cfg: &mut MilesguardConfig) {
    apply_env_overrides_with(cfg, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_env_overrides_with(
    cfg: &mut MilesguardConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
        cfg.channels.telegram.token = Secret::new(token);
    }
    if let Some(chat_id) = get("TELEGRAM_CHAT_ID") {
        cfg.channels.telegram.chat_id = Some(chat_id);
    }
    if let Some(dir) = get("WA_SESSION_PATH") {
        cfg.whatsapp.session_dir = PathBuf::from(dir);
    }
    if let Some(raw) = get("WA_RECONNECT_ATTEMPTS") {
        match raw.trim().parse() {
            Ok(n) => cfg.whatsapp.reconnect_attempts = n,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid WA_RECONNECT_ATTEMPTS"),
        }
    }
    if let Some(raw) = get("WA_RECONNECT_DELAY") {
        match raw.trim().parse() {
            Ok(ms) => cfg.whatsapp.reconnect_base_delay_ms = ms,
            Err(e) => warn!(value = %raw, error = %e, "ignoring invalid WA_RECONNECT_DELAY"),
        }
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    if let Some(p) = find_in_dir(Path::new(".")) {
        return Some(p);
    }
    config_dir().and_then(|dir| find_in_dir(&dir))
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/milesguard/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "milesguard").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<MilesguardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("milesguard.toml");
        std::fs::write(
            &toml_path,
            "[filter]\ntarget_groups = [\"Southern Flights\"]\nkeywords = [\"bonus\"]\n",
        )
        .unwrap();
        let cfg = load_config(&toml_path).unwrap();
        assert_eq!(cfg.filter.keywords, vec!["bonus"]);

        let yaml_path = dir.path().join("milesguard.yaml");
        std::fs::write(&yaml_path, "filter:\n  keywords: [\"100%\"]\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().filter.keywords, vec!["100%"]);

        let json_path = dir.path().join("milesguard.json");
        std::fs::write(&json_path, r#"{"dispatch":{"max_attempts":7}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().dispatch.max_attempts, 7);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milesguard.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/milesguard.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/milesguard.toml"));
    }

    #[test]
    fn find_in_dir_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("milesguard.json"), "{}").unwrap();
        std::fs::write(dir.path().join("milesguard.toml"), "").unwrap();
        let found = find_in_dir(dir.path()).unwrap();
        assert!(found.ends_with("milesguard.toml"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = MilesguardConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "TELEGRAM_BOT_TOKEN" => Some("123:abc".into()),
            "TELEGRAM_CHAT_ID" => Some("-1001".into()),
            "WA_SESSION_PATH" => Some("/var/lib/milesguard".into()),
            "WA_RECONNECT_ATTEMPTS" => Some("8".into()),
            "WA_RECONNECT_DELAY" => Some("2500".into()),
            _ => None,
        });
        assert_eq!(cfg.channels.telegram.token.expose_secret(), "123:abc");
        assert_eq!(cfg.channels.telegram.chat_id.as_deref(), Some("-1001"));
        assert_eq!(cfg.whatsapp.session_dir, PathBuf::from("/var/lib/milesguard"));
        assert_eq!(cfg.whatsapp.reconnect_attempts, 8);
        assert_eq!(cfg.whatsapp.reconnect_base_delay_ms, 2500);
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut cfg = MilesguardConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "WA_RECONNECT_ATTEMPTS" => Some("many".into()),
            "TELEGRAM_CHAT_ID" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.whatsapp.reconnect_attempts, 5);
        assert!(cfg.channels.telegram.chat_id.is_none());
    }

    #[test]
    fn runtime_load_rejects_empty_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milesguard.toml");
        std::fs::write(&path, "[filter]\ntarget_groups = []\nkeywords = []\n").unwrap();
        let err = load_runtime_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }

    #[test]
    fn runtime_load_accepts_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("milesguard.toml");
        std::fs::write(
            &path,
            "[filter]\ntarget_groups = [\"Southern Flights\"]\nkeywords = [\"bonus\"]\n",
        )
        .unwrap();
        let cfg = load_runtime_config(Some(&path)).unwrap();
        assert_eq!(cfg.filter.target_groups, vec!["Southern Flights"]);
    }
}
