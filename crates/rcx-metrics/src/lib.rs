// SPDX-License-Identifier: MIT OR Apache-2.0
//! Metrics Aggregator.
//!
//! Incrementally rolls a tenant's job statistics into a [`MetricSnapshot`]:
//! an accumulator fed one finding at a time, plus a `finish()` that
//! produces the serializable snapshot, generalized here from event-kind
//! counts to rule/severity/standard/MITRE counts.

use chrono::{DateTime, Utc};
use rcx_core::{MetricSnapshot, Rule, Severity, TenantKey};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_ingest::StatisticsDocument;
use rcx_store::RecordStore;
use std::collections::{BTreeMap, BTreeSet};

const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
const TOP_FINDINGS_LIMIT: usize = 20;

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

/// Incrementally accumulates statistics documents into a snapshot.
///
/// One aggregator covers one tenant's aggregation run; call [`add`](Self::add)
/// once per job statistics document, then [`finish`](Self::finish) to merge
/// with whatever snapshot preceded this run.
#[derive(Debug, Default)]
pub struct MetricAggregator {
    by_resource_type: BTreeMap<String, u64>,
    by_severity: BTreeMap<String, u64>,
    mitre_map: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    standard_totals: BTreeMap<String, BTreeSet<String>>,
    standard_covered: BTreeMap<String, BTreeSet<String>>,
    region_coverage: BTreeSet<String>,
    last_scan_date: Option<DateTime<Utc>>,
    top_findings: Vec<String>,
}

impl MetricAggregator {
    /// Construct an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one job's statistics document into the running totals.
    ///
    /// `rules` maps `rule_id` to the [`Rule`] record it was compiled
    /// against, so resource type, severity, standards, and MITRE mappings
    /// can be attributed per outcome.
    pub fn add(&mut self, doc: &StatisticsDocument, rules: &BTreeMap<String, Rule>, scanned_at: DateTime<Utc>) {
        self.last_scan_date = Some(self.last_scan_date.map_or(scanned_at, |prev| prev.max(scanned_at)));

        for entry in &doc.per_rule {
            self.region_coverage.insert(entry.region.clone());
            let Some(rule) = rules.get(&entry.rule_id) else {
                continue;
            };

            for (standard, controls) in &rule.standards {
                let totals = self.standard_totals.entry(standard.clone()).or_default();
                for control in controls {
                    totals.insert(control.clone());
                }
            }

            let passed = entry.status == rcx_core::FindingStatus::Passed;
            if passed {
                for (standard, controls) in &rule.standards {
                    let covered = self.standard_covered.entry(standard.clone()).or_default();
                    for control in controls {
                        covered.insert(control.clone());
                    }
                }
                continue;
            }

            *self.by_resource_type.entry(rule.resource_type.clone()).or_insert(0) += entry.resources_scanned as u64;
            *self.by_severity.entry(severity_label(rule.severity).to_string()).or_insert(0) += entry.resources_scanned as u64;

            for (tactic, techniques) in &rule.mitre {
                let bucket = self.mitre_map.entry(tactic.clone()).or_default();
                for technique in techniques {
                    let resources = bucket.entry(technique.clone()).or_default();
                    for resource in &entry.failed_resources {
                        if !resources.contains(&resource.id) {
                            resources.push(resource.id.clone());
                        }
                    }
                }
            }

            for resource in &entry.failed_resources {
                if self.top_findings.len() < TOP_FINDINGS_LIMIT {
                    self.top_findings.push(resource.id.clone());
                }
            }
        }
    }

    /// Finish this run, producing a [`MetricSnapshot`] for `(tenant, as_of)`
    /// that carries forward counts from `previous` (the last snapshot for
    /// this tenant, if any).
    #[must_use]
    pub fn finish(self, tenant: TenantKey, as_of: DateTime<Utc>, previous: Option<&MetricSnapshot>) -> MetricSnapshot {
        let mut by_resource_type = previous.map(|p| p.by_resource_type.clone()).unwrap_or_default();
        for (key, count) in self.by_resource_type {
            *by_resource_type.entry(key).or_insert(0) += count;
        }

        let mut by_severity = previous.map(|p| p.by_severity.clone()).unwrap_or_default();
        for (key, count) in self.by_severity {
            *by_severity.entry(key).or_insert(0) += count;
        }

        let mut mitre_map = previous.map(|p| p.mitre_map.clone()).unwrap_or_default();
        for (tactic, techniques) in self.mitre_map {
            let bucket = mitre_map.entry(tactic).or_default();
            for (technique, resources) in techniques {
                let existing = bucket.entry(technique).or_default();
                for resource in resources {
                    if !existing.contains(&resource) {
                        existing.push(resource);
                    }
                }
            }
        }

        let compliance_ratios = self
            .standard_totals
            .iter()
            .map(|(standard, total)| {
                let covered = self.standard_covered.get(standard).map_or(0, BTreeSet::len);
                let ratio = if total.is_empty() { 1.0 } else { covered as f64 / total.len() as f64 };
                (standard.clone(), ratio)
            })
            .collect();

        let mut region_coverage = previous.map(|p| p.region_coverage.clone()).unwrap_or_default();
        region_coverage.extend(self.region_coverage);

        let mut top_findings = previous.map(|p| p.top_findings.clone()).unwrap_or_default();
        for finding in self.top_findings {
            if top_findings.len() >= TOP_FINDINGS_LIMIT {
                break;
            }
            if !top_findings.contains(&finding) {
                top_findings.push(finding);
            }
        }

        let last_scan_date = match (self.last_scan_date, previous.and_then(|p| p.last_scan_date)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, prev) => prev,
        };

        MetricSnapshot {
            version: SNAPSHOT_SCHEMA_VERSION,
            tenant,
            as_of,
            by_resource_type,
            by_severity,
            mitre_map,
            compliance_ratios,
            last_scan_date,
            region_coverage,
            top_findings,
        }
    }
}

/// Record-store key for a tenant's snapshot on a given day.
#[must_use]
pub fn snapshot_key(tenant: &TenantKey, as_of_date: chrono::NaiveDate) -> String {
    format!("{}/snapshots/{as_of_date}", tenant.scan_prefix())
}

/// Write `snapshot` idempotently, keyed on `(tenant, as_of_date)`. Re-runs
/// for the same day overwrite the prior record rather than conflicting.
///
/// # Errors
///
/// Propagates any backing-store failure other than a version conflict.
pub fn put_snapshot(store: &dyn RecordStore<MetricSnapshot>, snapshot: &MetricSnapshot) -> CoreResult<()> {
    let key = snapshot_key(&snapshot.tenant, snapshot.as_of.date_naive());
    let expected_version = store.get(&key)?.map(|r| r.version);
    store.put(&key, snapshot.clone(), expected_version).map_err(|e| {
        if e.kind == ErrorKind::Conflict {
            CoreError::new(ErrorKind::Conflict, "snapshot was updated concurrently, retry the aggregation run")
        } else {
            e
        }
    })?;
    Ok(())
}

/// Delete snapshots for `tenant` older than `retain_days` relative to `now`.
///
/// # Errors
///
/// Propagates any backing-store failure.
pub fn prune_expired_snapshots(store: &dyn RecordStore<MetricSnapshot>, tenant: &TenantKey, retain_days: i64, now: DateTime<Utc>) -> CoreResult<usize> {
    let mut pruned = 0;
    for key in store.scan_prefix(&format!("{}/snapshots/", tenant.scan_prefix()))? {
        let Some(record) = store.get(&key)? else {
            continue;
        };
        if (now - record.value.as_of).num_days() > retain_days {
            store.delete(&key)?;
            pruned += 1;
        }
    }
    Ok(pruned)
}
