// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI profile loading and validation.
//!
//! Distinct from `rcx_config::RuntimeSettings`, which governs the daemon's
//! own process. This is the operator-facing defaults file consulted by
//! `rcx configure` / `rcx show_config` — which customer/tenant a bare
//! invocation targets, and where the local record stores live.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level CLI profile, normally `~/.config/rcx/profile.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CliProfile {
    /// Customer id assumed when a command omits `--customer-id`.
    #[serde(default)]
    pub default_customer_id: Option<String>,
    /// Tenant name assumed when a command omits `--tenant-name`.
    #[serde(default)]
    pub default_tenant_name: Option<String>,
    /// Root directory for the filesystem-backed record and blob stores this
    /// CLI opens in-process.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for CliProfile {
    fn default() -> Self {
        Self {
            default_customer_id: None,
            default_tenant_name: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Errors found while validating a loaded profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyField { field: &'static str },
    RelativeDataDirOutsideCwd { path: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyField { field } => write!(f, "field must not be blank if set: {field}"),
            ConfigError::RelativeDataDirOutsideCwd { path } => {
                write!(f, "data_dir escapes the current directory: {path}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load and parse a TOML profile file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse as valid
/// TOML matching [`CliProfile`]'s shape.
pub fn load_profile(path: &Path) -> anyhow::Result<CliProfile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read profile '{}': {e}", path.display()))?;
    let profile: CliProfile = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse profile '{}': {e}", path.display()))?;
    Ok(profile)
}

/// Validate a parsed profile, returning every semantic error found.
pub fn validate_profile(profile: &CliProfile) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if let Some(customer_id) = &profile.default_customer_id {
        if customer_id.trim().is_empty() {
            errors.push(ConfigError::EmptyField { field: "default_customer_id" });
        }
    }
    if let Some(tenant_name) = &profile.default_tenant_name {
        if tenant_name.trim().is_empty() {
            errors.push(ConfigError::EmptyField { field: "default_tenant_name" });
        }
    }
    if profile.data_dir.components().any(|c| c.as_os_str() == "..") {
        errors.push(ConfigError::RelativeDataDirOutsideCwd {
            path: profile.data_dir.display().to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
