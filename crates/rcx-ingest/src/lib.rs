// SPDX-License-Identifier: MIT OR Apache-2.0
//! Result Ingestor.
//!
//! Pure, side-effect-free canonicalization of a worker's raw per-region
//! output into a [`StatisticsDocument`]. Nothing here touches a blob store
//! or a record store — the caller reads `results/{job_id}/` and hands the
//! parsed records in, which keeps every tie-break here deterministic and
//! unit-testable without a filesystem.

use chrono::{DateTime, Utc};
use rcx_core::{FindingStatus, IngestErrorKind, JobId, ResourceIdentity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of failed-resource samples kept per rule and in the
/// overall summary.
pub const SAMPLE_LIMIT: usize = 20;

/// One raw `(rule_id, region)` record read from a worker's output tree,
/// before canonicalization.
#[derive(Debug, Clone)]
pub struct RawRegionRecord {
    /// Rule (policy) this record covers.
    pub rule_id: String,
    /// Region this record covers.
    pub region: String,
    /// Matched resources, as emitted by the evaluator. May contain
    /// duplicates, which canonicalization removes.
    pub resources: Vec<ResourceIdentity>,
    /// Error encountered while evaluating this rule in this region, if any.
    pub error: Option<RawError>,
    /// When evaluation of this record started.
    pub started_at: DateTime<Utc>,
    /// When evaluation of this record finished.
    pub finished_at: DateTime<Utc>,
}

/// An error surfaced by the evaluator for one raw record.
#[derive(Debug, Clone)]
pub struct RawError {
    /// Classification, used to pick a winner when a rule has several.
    pub kind: IngestErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// Canonical per-`(rule_id, region)` outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleStatistics {
    /// Rule this entry covers.
    pub rule_id: String,
    /// Region this entry covers.
    pub region: String,
    /// Canonical outcome.
    pub status: FindingStatus,
    /// RFC 3339 UTC start time.
    pub started_at: DateTime<Utc>,
    /// RFC 3339 UTC finish time.
    pub finished_at: DateTime<Utc>,
    /// Count of deduplicated resources evaluated.
    pub resources_scanned: usize,
    /// Wall-clock duration, in milliseconds.
    pub elapsed_time_ms: i64,
    /// Deduplicated matched resources, capped at [`SAMPLE_LIMIT`].
    pub failed_resources: Vec<ResourceIdentity>,
    /// Highest-priority error classification, set only on an error outcome.
    pub error_kind: Option<IngestErrorKind>,
    /// Message belonging to `error_kind`, set only on an error outcome.
    pub error_message: Option<String>,
}

/// Aggregate counts across every rule in a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesSummary {
    /// Total rules the ruleset contained, evaluated or not.
    pub total: usize,
    /// Rules excluded from this ruleset and never evaluated.
    pub disabled: usize,
    /// Rules that resolved to `PASSED`.
    pub passed: usize,
    /// Rules that resolved to `FAILED` or `ERROR`.
    pub failed: usize,
    /// A bounded sample of resources from failed rules, for quick review.
    pub failed_resource_samples: Vec<ResourceIdentity>,
}

/// Canonical statistics document for one job, written to
/// `statistics/{job_id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsDocument {
    /// Job this document covers.
    pub job_id: JobId,
    /// One entry per `(rule_id, region)` pair that was evaluated.
    pub per_rule: Vec<RuleStatistics>,
    /// Aggregate rollup across `per_rule`.
    pub rules_summary: RulesSummary,
    /// When this document was computed.
    pub computed_at: DateTime<Utc>,
}

/// Deduplicate resources by `(id, resource_type, location)`, preserving the
/// first occurrence's ordering.
#[must_use]
pub fn dedup_resources(resources: &[ResourceIdentity]) -> Vec<ResourceIdentity> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for resource in resources {
        let key = (resource.id.clone(), resource.resource_type.clone(), resource.location.clone());
        if seen.insert(key) {
            out.push(resource.clone());
        }
    }
    out
}

/// Pick the canonical status + error for one `(rule_id, region)` group of
/// raw records, applying the `CREDENTIALS > ACCESS > QUOTA > THROTTLING >
/// INTERNAL` priority order when more than one error is present.
fn canonicalize_group(records: &[RawRegionRecord]) -> (FindingStatus, Vec<ResourceIdentity>, Option<IngestErrorKind>, Option<String>) {
    let mut resources = Vec::new();
    for record in records {
        resources.extend(record.resources.iter().cloned());
    }
    let resources = dedup_resources(&resources);

    let best_error = records
        .iter()
        .filter_map(|r| r.error.as_ref())
        .min_by_key(|e| e.kind);

    match best_error {
        Some(error) => (FindingStatus::Error, resources, Some(error.kind), Some(error.message.clone())),
        None if resources.is_empty() => (FindingStatus::Passed, resources, None, None),
        None => (FindingStatus::Failed, resources, None, None),
    }
}

/// Canonicalize a job's raw output records into a [`StatisticsDocument`].
///
/// `total_rules` and `disabled_rules` come from the ruleset the job was
/// compiled against, since a worker only ever emits records for rules it
/// actually evaluated.
#[must_use]
pub fn canonicalize(job_id: JobId, records: &[RawRegionRecord], total_rules: usize, disabled_rules: usize, now: DateTime<Utc>) -> StatisticsDocument {
    let mut groups: BTreeMap<(String, String), Vec<RawRegionRecord>> = BTreeMap::new();
    for record in records {
        groups.entry((record.rule_id.clone(), record.region.clone())).or_default().push(record.clone());
    }

    let mut per_rule = Vec::new();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut failed_resource_samples = Vec::new();

    for ((rule_id, region), group) in groups {
        let (status, resources, error_kind, error_message) = canonicalize_group(&group);
        let started_at = group.iter().map(|r| r.started_at).min().unwrap_or(now);
        let finished_at = group.iter().map(|r| r.finished_at).max().unwrap_or(now);
        let elapsed_time_ms = (finished_at - started_at).num_milliseconds().max(0);

        match status {
            FindingStatus::Passed => passed += 1,
            FindingStatus::Failed | FindingStatus::Error => {
                failed += 1;
                for resource in &resources {
                    if failed_resource_samples.len() >= SAMPLE_LIMIT {
                        break;
                    }
                    failed_resource_samples.push(resource.clone());
                }
            }
        }

        let resources_scanned = resources.len();
        per_rule.push(RuleStatistics {
            rule_id,
            region,
            status,
            started_at,
            finished_at,
            resources_scanned,
            elapsed_time_ms,
            failed_resources: resources.into_iter().take(SAMPLE_LIMIT).collect(),
            error_kind,
            error_message,
        });
    }

    StatisticsDocument {
        job_id,
        per_rule,
        rules_summary: RulesSummary {
            total: total_rules,
            disabled: disabled_rules,
            passed,
            failed,
            failed_resource_samples,
        },
        computed_at: now,
    }
}
