//! Configuration loading, validation, and env substitution.
//!
//! Config files: `milesguard.toml`, `milesguard.yaml`, or `milesguard.json`
//! Searched in `./` then `~/.config/milesguard/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        apply_env_overrides, apply_env_overrides_with, config_dir, discover_and_load, load_config,
        load_runtime_config,
    },
    schema::{
        ChannelsConfig, DedupConfig, DispatchConfig, FileLogConfig, FilterConfig,
        MilesguardConfig, TelegramConfig, WhatsAppConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
