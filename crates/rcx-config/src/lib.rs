// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Configuration loading, validation, and merging for the rule engine substrate.
//!
//! [`RuntimeSettings`] is the single immutable value every binary constructs
//! once at startup from environment variables, then an optional on-disk TOML
//! overlay — never mutated in place afterward (§9 Design Notes).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },
    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Which deployment mode this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    /// The HTTP control-plane daemon.
    #[default]
    Daemon,
    /// A scan-worker runtime.
    Worker,
    /// The scheduler tick loop.
    Scheduler,
    /// A one-shot CLI invocation.
    Cli,
}

/// Top-level immutable runtime configuration.
///
/// Every field maps to one of the environment variables named in the
/// external-interfaces section (`RCX_*`), with an on-disk TOML overlay and
/// sensible defaults applied in between.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RuntimeSettings {
    /// `RCX_SERVICE_MODE`
    #[serde(default)]
    pub service_mode: ServiceMode,
    /// `RCX_MONGO_URI` — Record Store backend connection string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_store_uri: Option<String>,
    /// `RCX_MONGO_DB`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_store_db: Option<String>,
    /// `RCX_VAULT_URL` — Secret Broker backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_url: Option<String>,
    /// `RCX_VAULT_TOKEN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_token: Option<String>,
    /// `RCX_BLOB_STORE_ENDPOINT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_store_endpoint: Option<String>,
    /// `RCX_BLOB_STORE_CREDENTIALS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_store_credentials: Option<String>,
    /// `RCX_REDIS_URL` — worker broker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// `RCX_WORKER_BROKER_URL` — celery-style task queue URL, if distinct from Redis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_broker_url: Option<String>,
    /// `RCX_LOG_LEVEL`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `RCX_EXECUTOR_LOG_LEVEL` — log level for the spawned policy-evaluator process.
    #[serde(default = "default_log_level")]
    pub executor_log_level: String,
    /// `RCX_EXECUTOR_LOG_FILE`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_log_file: Option<String>,
    /// `RCX_SIEM_PAYLOAD_MAX_BYTES` — overflow is fail-fast `VALIDATION` (§9 Open Question c).
    #[serde(default = "default_siem_payload_max_bytes")]
    pub siem_payload_max_bytes: u64,
    /// `RCX_METRICS_EXPIRATION_DAYS`
    #[serde(default = "default_metrics_expiration_days")]
    pub metrics_expiration_days: u32,
    /// `RCX_RECOMMENDATIONS_BUCKET`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations_bucket: Option<String>,
    /// `RCX_ALLOW_SIMULTANEOUS_PER_TENANT` — default-off (§9 Open Question b).
    #[serde(default)]
    pub allow_simultaneous_jobs_per_tenant: bool,
    /// `RCX_SYSTEM_USER_PASSWORD` — required at first init, never logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_user_password: Option<String>,
    /// `HTTP_PROXY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    /// `HTTPS_PROXY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    /// `NO_PROXY`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
    /// `RCX_TENANT_SLOT_TTL_SECS` — janitor reclaim window, default 3h.
    #[serde(default = "default_slot_ttl_secs")]
    pub tenant_slot_ttl_secs: u64,
    /// `RCX_CANCEL_GRACE_SECS` — default 30s.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// `RCX_WORKER_TIMEOUT_SECS` — default 2h.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// `RCX_POLICY_EVALUATOR_COMMAND` — executable the worker spawns per
    /// region to evaluate a compiled policy bundle.
    #[serde(default = "default_policy_evaluator_command")]
    pub policy_evaluator_command: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_siem_payload_max_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_metrics_expiration_days() -> u32 {
    90
}
fn default_slot_ttl_secs() -> u64 {
    3 * 3600
}
fn default_cancel_grace_secs() -> u64 {
    30
}
fn default_worker_timeout_secs() -> u64 {
    2 * 3600
}
fn default_policy_evaluator_command() -> String {
    "rcx-policy-evaluator".into()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            service_mode: ServiceMode::default(),
            record_store_uri: None,
            record_store_db: None,
            vault_url: None,
            vault_token: None,
            blob_store_endpoint: None,
            blob_store_credentials: None,
            redis_url: None,
            worker_broker_url: None,
            log_level: default_log_level(),
            executor_log_level: default_log_level(),
            executor_log_file: None,
            siem_payload_max_bytes: default_siem_payload_max_bytes(),
            metrics_expiration_days: default_metrics_expiration_days(),
            recommendations_bucket: None,
            allow_simultaneous_jobs_per_tenant: false,
            system_user_password: None,
            http_proxy: None,
            https_proxy: None,
            no_proxy: None,
            tenant_slot_ttl_secs: default_slot_ttl_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            worker_timeout_secs: default_worker_timeout_secs(),
            policy_evaluator_command: default_policy_evaluator_command(),
        }
    }
}

/// Load settings: defaults, then an optional TOML file overlay, then
/// environment variable overrides (highest precedence).
pub fn load_settings(path: Option<&Path>) -> Result<RuntimeSettings, ConfigError> {
    let mut settings = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => RuntimeSettings::default(),
    };
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Parse a TOML string into a [`RuntimeSettings`] overlay.
pub fn parse_toml(content: &str) -> Result<RuntimeSettings, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `RCX_*`/proxy environment variable overrides in place.
pub fn apply_env_overrides(settings: &mut RuntimeSettings) {
    macro_rules! env_str {
        ($var:literal, $field:expr) => {
            if let Ok(v) = std::env::var($var) {
                $field = Some(v);
            }
        };
    }
    env_str!("RCX_MONGO_URI", settings.record_store_uri);
    env_str!("RCX_MONGO_DB", settings.record_store_db);
    env_str!("RCX_VAULT_URL", settings.vault_url);
    env_str!("RCX_VAULT_TOKEN", settings.vault_token);
    env_str!("RCX_BLOB_STORE_ENDPOINT", settings.blob_store_endpoint);
    env_str!("RCX_BLOB_STORE_CREDENTIALS", settings.blob_store_credentials);
    env_str!("RCX_REDIS_URL", settings.redis_url);
    env_str!("RCX_WORKER_BROKER_URL", settings.worker_broker_url);
    env_str!("RCX_EXECUTOR_LOG_FILE", settings.executor_log_file);
    env_str!("RCX_RECOMMENDATIONS_BUCKET", settings.recommendations_bucket);
    env_str!("RCX_SYSTEM_USER_PASSWORD", settings.system_user_password);
    if let Ok(v) = std::env::var("RCX_POLICY_EVALUATOR_COMMAND") {
        settings.policy_evaluator_command = v;
    }
    env_str!("HTTP_PROXY", settings.http_proxy);
    env_str!("HTTPS_PROXY", settings.https_proxy);
    env_str!("NO_PROXY", settings.no_proxy);

    if let Ok(v) = std::env::var("RCX_LOG_LEVEL") {
        settings.log_level = v;
    }
    if let Ok(v) = std::env::var("RCX_EXECUTOR_LOG_LEVEL") {
        settings.executor_log_level = v;
    }
    if let Ok(v) = std::env::var("RCX_SERVICE_MODE") {
        settings.service_mode = match v.as_str() {
            "worker" => ServiceMode::Worker,
            "scheduler" => ServiceMode::Scheduler,
            "cli" => ServiceMode::Cli,
            _ => ServiceMode::Daemon,
        };
    }
    if let Ok(v) = std::env::var("RCX_ALLOW_SIMULTANEOUS_PER_TENANT") {
        settings.allow_simultaneous_jobs_per_tenant = matches!(v.as_str(), "1" | "true" | "yes");
    }
    if let Ok(v) = std::env::var("RCX_SIEM_PAYLOAD_MAX_BYTES") {
        if let Ok(n) = v.parse() {
            settings.siem_payload_max_bytes = n;
        }
    }
    if let Ok(v) = std::env::var("RCX_METRICS_EXPIRATION_DAYS") {
        if let Ok(n) = v.parse() {
            settings.metrics_expiration_days = n;
        }
    }
    if let Ok(v) = std::env::var("RCX_TENANT_SLOT_TTL_SECS") {
        if let Ok(n) = v.parse() {
            settings.tenant_slot_ttl_secs = n;
        }
    }
    if let Ok(v) = std::env::var("RCX_CANCEL_GRACE_SECS") {
        if let Ok(n) = v.parse() {
            settings.cancel_grace_secs = n;
        }
    }
    if let Ok(v) = std::env::var("RCX_WORKER_TIMEOUT_SECS") {
        if let Ok(n) = v.parse() {
            settings.worker_timeout_secs = n;
        }
    }
}

/// Validate settings, surfacing hard errors for impossible combinations.
///
/// `system_user_password` is required only on first init; callers pass
/// `first_init = true` from the daemon bootstrap path.
pub fn validate_settings(settings: &RuntimeSettings, first_init: bool) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    const VALID_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
    if !VALID_LEVELS.contains(&settings.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", settings.log_level));
    }
    if !VALID_LEVELS.contains(&settings.executor_log_level.as_str()) {
        errors.push(format!(
            "invalid executor_log_level '{}'",
            settings.executor_log_level
        ));
    }
    if settings.siem_payload_max_bytes == 0 {
        errors.push("siem_payload_max_bytes must be non-zero".into());
    }
    if settings.policy_evaluator_command.trim().is_empty() {
        errors.push("policy_evaluator_command must not be blank".into());
    }
    if first_init && settings.system_user_password.is_none() {
        errors.push("system_user_password is required at first init".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let s = RuntimeSettings::default();
        assert_eq!(s.log_level, "info");
        assert!(!s.allow_simultaneous_jobs_per_tenant);
        assert_eq!(s.tenant_slot_ttl_secs, 3 * 3600);
    }

    #[test]
    fn validation_rejects_bad_log_level() {
        let mut s = RuntimeSettings::default();
        s.log_level = "verbose".into();
        assert!(validate_settings(&s, false).is_err());
    }

    #[test]
    fn first_init_requires_password() {
        let s = RuntimeSettings::default();
        assert!(validate_settings(&s, true).is_err());
        let mut s2 = s.clone();
        s2.system_user_password = Some("secret".into());
        assert!(validate_settings(&s2, true).is_ok());
    }

    #[test]
    fn toml_overlay_parses() {
        let toml_str = r#"
            log_level = "debug"
            allow_simultaneous_jobs_per_tenant = true
        "#;
        let s = parse_toml(toml_str).unwrap();
        assert_eq!(s.log_level, "debug");
        assert!(s.allow_simultaneous_jobs_per_tenant);
    }

    #[test]
    fn load_missing_file_errors() {
        let err = load_settings(Some(Path::new("/nonexistent/rcx.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
