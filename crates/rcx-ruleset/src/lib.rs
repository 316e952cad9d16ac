// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Ruleset Compiler.
//!
//! Turns a cloud + rule selector into a materialized, content-addressed
//! policy bundle. Compilation is cached by fingerprint: two selectors that
//! resolve to the same `(cloud, sorted rule ids, filter)` never compile
//! twice.

use rcx_catalog::{query_rules, RuleFilter};
use rcx_core::{hash::ruleset_fingerprint, CloudKind, Rule, RuleSet, RuleSetId, RuleSetStatus};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_store::{BlobStore, RecordStore};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the candidate rule set for a compile is chosen.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "form", content = "value", rename_all = "snake_case")]
pub enum RuleSelector {
    /// An explicit, caller-supplied list of rule ids.
    Explicit(Vec<String>),
    /// Everything matching any of `standards`, optionally narrowed to one
    /// `service`.
    Filter {
        /// Compliance standards to match (OR'd together).
        standards: Vec<String>,
        /// Optional service narrowing.
        service: Option<String>,
    },
}

impl RuleSelector {
    fn as_filter_predicate(&self) -> serde_json::Value {
        match self {
            RuleSelector::Explicit(ids) => serde_json::json!({ "explicit": ids }),
            RuleSelector::Filter { standards, service } => {
                serde_json::json!({ "standards": standards, "service": service })
            }
        }
    }
}

/// Everything the compiler needs beyond the rule catalog and bundle stores.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Rule ids to drop regardless of selector match.
    pub excluded_rules: BTreeSet<String>,
    /// If set, only rules in this allow-list survive (license scoping).
    pub license_allowed: Option<BTreeSet<String>>,
    /// License key to stamp onto the resulting `RuleSet`, if scoped.
    pub license_key: Option<rcx_core::LicenseKey>,
    /// Name to assign the resulting bundle.
    pub name: String,
}

fn ruleset_artifact_key(id: RuleSetId) -> String {
    format!("rulesets/{id}/bundle.txt")
}

fn candidate_rule_ids(
    rule_store: &dyn RecordStore<Rule>,
    cloud: CloudKind,
    selector: &RuleSelector,
) -> CoreResult<Vec<String>> {
    match selector {
        RuleSelector::Explicit(ids) => {
            let mut present = Vec::new();
            for id in ids {
                if let Some(record) = rule_store.get(id)? {
                    if record.value.cloud == cloud && !record.value.tombstoned {
                        present.push(id.clone());
                    }
                }
            }
            Ok(present)
        }
        RuleSelector::Filter { standards, service } => {
            let mut ids = BTreeSet::new();
            let standards = if standards.is_empty() {
                vec![None]
            } else {
                standards.iter().map(|s| Some(s.clone())).collect()
            };
            for standard in standards {
                let mut cursor = None;
                loop {
                    let filter = RuleFilter {
                        cloud: Some(cloud),
                        standard: standard.clone(),
                        service: service.clone(),
                        ..Default::default()
                    };
                    let page = query_rules(rule_store, &filter, cursor.as_ref(), 200)?;
                    let exhausted = page.next_cursor.is_none();
                    for rule in page.rules {
                        ids.insert(rule.rule_id);
                    }
                    if exhausted {
                        break;
                    }
                    cursor = page.next_cursor;
                }
            }
            Ok(ids.into_iter().collect())
        }
    }
}

/// Compile `selector` for `cloud` into a ready ruleset bundle, or return an
/// existing bundle sharing the same fingerprint.
///
/// # Errors
///
/// Returns [`ErrorKind::NoRules`] if the selector, after exclusions and
/// license scoping, resolves to an empty set. Returns
/// [`ErrorKind::Internal`] if the bundle cannot be assembled or stored.
pub fn compile(
    cloud: CloudKind,
    selector: &RuleSelector,
    options: &CompileOptions,
    rule_store: &dyn RecordStore<Rule>,
    ruleset_store: &dyn RecordStore<RuleSet>,
    blob_store: &dyn BlobStore,
) -> CoreResult<RuleSet> {
    // 1. Materialize candidates.
    let mut rule_ids = candidate_rule_ids(rule_store, cloud, selector)?;

    // 2. Apply exclusions, then license allow-list intersection.
    rule_ids.retain(|id| !options.excluded_rules.contains(id));
    if let Some(allowed) = &options.license_allowed {
        rule_ids.retain(|id| allowed.contains(id));
    }
    if rule_ids.is_empty() {
        return Err(CoreError::new(
            ErrorKind::NoRules,
            "rule selector resolved to an empty set after exclusions and license scoping",
        ));
    }
    rule_ids.sort();
    rule_ids.dedup();

    // 3. Fingerprint and look for a READY match.
    let filter_predicate = selector.as_filter_predicate();
    let fingerprint = ruleset_fingerprint(&cloud.to_string(), &rule_ids, &filter_predicate)
        .map_err(|e| CoreError::new(ErrorKind::Internal, format!("fingerprint: {e}")))?;

    for key in ruleset_store.scan_prefix("")? {
        if let Some(record) = ruleset_store.get(&key)? {
            if record.value.fingerprint == fingerprint && record.value.status == RuleSetStatus::Ready
            {
                tracing::debug!(target: "rcx.ruleset.compile", %fingerprint, "reusing existing ready bundle");
                return Ok(record.value);
            }
        }
    }

    // 4. Create a COMPILING record, assemble the bundle, transition to READY.
    let id = RuleSetId::new();
    let mut ruleset = RuleSet {
        id,
        name: options.name.clone(),
        cloud,
        rule_ids: rule_ids.clone(),
        status: RuleSetStatus::Compiling,
        artifact_key: None,
        fingerprint: fingerprint.clone(),
        license_key: options.license_key.clone(),
        reference_count: 0,
    };
    let version = match ruleset_store.put(&id.to_string(), ruleset.clone(), None) {
        Ok(v) => v,
        Err(e) if e.kind == ErrorKind::Conflict => {
            // Lost a race to create this id; vanishingly unlikely given
            // RuleSetId is a random uuid, but treated as retryable.
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    let bundle = assemble_policy_bundle(cloud, &rule_ids);
    let artifact_key = ruleset_artifact_key(id);
    if let Err(e) = blob_store.put(&artifact_key, &bundle) {
        ruleset.status = RuleSetStatus::Failed;
        let _ = ruleset_store.put(&id.to_string(), ruleset, Some(version));
        return Err(e);
    }

    // 5. Optimistic transition COMPILING -> READY: only one writer wins.
    ruleset.status = RuleSetStatus::Ready;
    ruleset.artifact_key = Some(artifact_key);
    match ruleset_store.put(&id.to_string(), ruleset.clone(), Some(version)) {
        Ok(_) => {
            tracing::info!(target: "rcx.ruleset.compile", %fingerprint, rule_count = rule_ids.len(), "ruleset ready");
            Ok(ruleset)
        }
        Err(e) if e.kind == ErrorKind::Conflict => {
            // Another writer already promoted this record; return its view.
            ruleset_store
                .get(&id.to_string())?
                .map(|r| r.value)
                .ok_or(e)
        }
        Err(e) => Err(e),
    }
}

/// Assemble a newline-delimited policy bundle document for `rule_ids`.
///
/// This is the artifact layout the worker's policy evaluator expects: one
/// `cloud:rule_id` pair per line, sorted for reproducibility.
#[must_use]
pub fn assemble_policy_bundle(cloud: CloudKind, rule_ids: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for id in rule_ids {
        out.push_str(&cloud.to_string());
        out.push(':');
        out.push_str(id);
        out.push('\n');
    }
    out.into_bytes()
}

/// Whether `ruleset_id` may be deleted: true iff no non-terminal job still
/// references it in `jobs`.
#[must_use]
pub fn can_delete(ruleset_id: RuleSetId, jobs: &[rcx_core::Job]) -> bool {
    !jobs.iter().any(|job| !job.state.is_terminal() && job.ruleset_ids.contains(&ruleset_id))
}
