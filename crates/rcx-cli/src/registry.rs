// SPDX-License-Identifier: MIT OR Apache-2.0
//! Flat `(group, subgroup, verb)` command registry.
//!
//! Every command is a pure function from a JSON payload (already matched
//! against the operation's schema) to a JSON result. The registry never
//! talks HTTP — it builds validated request records and hands them to the
//! core crates directly, the same "thin wrapper" role the external CLI
//! surface plays against the coordinator.

use anyhow::Result;
use rcx_daemon::state::AppState;
use std::collections::BTreeMap;

/// Identifies one command by its three-part name. `subgroup` is `""` for
/// commands with no subgroup (e.g. `license show`, as opposed to
/// `job scheduled register`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommandKey {
    pub group: String,
    pub subgroup: String,
    pub verb: String,
}

impl CommandKey {
    #[must_use]
    pub fn new(group: impl Into<String>, subgroup: impl Into<String>, verb: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            subgroup: subgroup.into(),
            verb: verb.into(),
        }
    }
}

impl std::fmt::Display for CommandKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.subgroup.is_empty() {
            write!(f, "{} {}", self.group, self.verb)
        } else {
            write!(f, "{} {} {}", self.group, self.subgroup, self.verb)
        }
    }
}

type Handler = fn(&AppState, serde_json::Value) -> Result<serde_json::Value>;
type SchemaFn = fn() -> serde_json::Value;

/// One registered command: its parameter schema and its handler.
pub struct CommandSpec {
    pub key: CommandKey,
    pub summary: &'static str,
    pub schema: SchemaFn,
    pub handler: Handler,
}

/// The flat command table, keyed by `(group, subgroup, verb)`.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<CommandKey, CommandSpec>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.key.clone(), spec);
    }

    #[must_use]
    pub fn get(&self, key: &CommandKey) -> Option<&CommandSpec> {
        self.commands.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }

    /// Look up `key`, validate `payload` against its schema, and run it.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is unknown, the payload fails
    /// schema validation, or the handler itself fails.
    pub fn dispatch(&self, key: &CommandKey, state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
        let spec = self
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("unknown command: {key}"))?;
        validate_against_schema(&(spec.schema)(), &payload)
            .map_err(|errors| anyhow::anyhow!("payload failed schema validation for {key}: {}", errors.join("; ")))?;
        (spec.handler)(state, payload)
    }
}

/// Minimal structural check: every `required` property named in the
/// schema's top level must be present in `payload`. Full JSON-schema
/// validation is out of scope; this catches the common "missing field"
/// mistake before it reaches a handler's `serde_json::from_value`.
fn validate_against_schema(schema: &serde_json::Value, payload: &serde_json::Value) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if payload.get(name).is_none() {
                errors.push(format!("missing required field: {name}"));
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
