// SPDX-License-Identifier: MIT OR Apache-2.0
//! Report Dispatcher.
//!
//! A retry/backoff loop over a fixed schedule: `15min × attempt`, capped at
//! 4 attempts, after which global sending disables and further requests
//! park as `PENDING`.

use chrono::{DateTime, Duration, Utc};
use rcx_core::{ResourceException, TenantKey};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_ingest::StatisticsDocument;
use rcx_store::RecordStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Maximum delivery attempts before global sending disables.
pub const MAX_ATTEMPTS: u32 = 4;
/// Backoff unit: `15min × attempt`.
pub const BACKOFF_UNIT_MINUTES: i64 = 15;
/// Hard cap on a report payload, enforced fail-fast rather than truncated.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// The report families a tenant or customer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Operational,
    Project,
    Department,
    CLevel,
    Compliance,
    Details,
    Digests,
    Errors,
    Rules,
    Findings,
}

/// Lifecycle state of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Parked: global sending is disabled, or retries are exhausted.
    Pending,
    /// Delivered successfully.
    Succeeded,
    /// The most recent attempt failed; a retry is scheduled.
    Failed,
    /// Superseded by an identical `(entity, report_type)` request.
    Duplicate,
}

/// One report delivery's persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStatistics {
    /// Tenant or customer this report covers.
    pub entity: TenantKey,
    /// Which report family this is.
    pub report_type: ReportType,
    /// Current lifecycle state.
    pub status: ReportStatus,
    /// Delivery attempts made so far.
    pub attempt: u32,
    /// When the next retry is due, set only while `status == Failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Message from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When this record was first created.
    pub created_at: DateTime<Utc>,
    /// When this record was last written.
    pub updated_at: DateTime<Utc>,
}

/// A push destination for a report payload (DefectDojo, Security Hub,
/// Chronicle, ...). Sink failures are surfaced as typed errors and must
/// never leak credential material into the error message.
pub trait ReportSink: Send + Sync {
    /// Push `payload` for `(entity, report_type)`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UpstreamUnavailable`] on a transient delivery
    /// failure, or another kind for a permanent rejection.
    fn send(&self, entity: &TenantKey, report_type: ReportType, payload: &[u8]) -> CoreResult<()>;
}

/// Record-store key for one `(entity, report_type)` report.
#[must_use]
pub fn report_key(entity: &TenantKey, report_type: ReportType) -> String {
    format!("{}/reports/{:?}", entity.scan_prefix(), report_type)
}

/// Process-wide kill switch: once tripped, every new dispatch parks as
/// `PENDING` instead of attempting delivery.
#[derive(Debug, Default)]
pub struct GlobalSendingSwitch(AtomicBool);

impl GlobalSendingSwitch {
    /// Construct a switch with sending enabled.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicBool::new(true))
    }

    /// Whether sending is currently enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Disable sending process-wide.
    pub fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Re-enable sending process-wide.
    pub fn enable(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Produce a report-facing copy of `document` with every resource matched
/// by a live (non-expired) exception removed from each rule's
/// `failed_resources` and from the rollup's `failed_resource_samples`.
///
/// The statistics document itself is never mutated — exceptions shape what
/// a sink receives, not what was actually scanned. Tag-filtered exceptions
/// never match here, since a canonicalized resource identity carries no
/// tags; only `ByIdentity` and `ByArn` exceptions take effect.
#[must_use]
pub fn apply_exceptions(document: &StatisticsDocument, exceptions: &[ResourceException], now: DateTime<Utc>) -> StatisticsDocument {
    let live: Vec<&ResourceException> = exceptions.iter().filter(|e| e.expire_at() > now).collect();
    let no_tags = BTreeMap::new();
    let is_excepted = |resource: &rcx_core::ResourceIdentity| live.iter().any(|e| e.matches(resource, &no_tags));

    let mut filtered = document.clone();
    for rule in &mut filtered.per_rule {
        rule.failed_resources.retain(|resource| !is_excepted(resource));
    }
    filtered.rules_summary.failed_resource_samples.retain(|resource| !is_excepted(resource));
    filtered
}

/// Dispatch one report, creating or updating its [`ReportStatistics`]
/// record. Oversized payloads fail fast as [`ErrorKind::Validation`]
/// rather than being silently truncated.
///
/// # Errors
///
/// Returns an error if the payload exceeds [`MAX_PAYLOAD_BYTES`], or if the
/// backing store cannot be written to.
pub fn dispatch(
    store: &dyn RecordStore<ReportStatistics>,
    sink: &dyn ReportSink,
    switch: &GlobalSendingSwitch,
    entity: &TenantKey,
    report_type: ReportType,
    payload: &[u8],
    now: DateTime<Utc>,
) -> CoreResult<ReportStatistics> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CoreError::new(
            ErrorKind::Validation,
            format!("report payload of {} bytes exceeds the {} byte limit", payload.len(), MAX_PAYLOAD_BYTES),
        ));
    }

    let key = report_key(entity, report_type);
    let existing = store.get(&key)?;
    let attempt = existing.as_ref().map_or(0, |r| r.value.attempt);
    let created_at = existing.as_ref().map_or(now, |r| r.value.created_at);

    if !switch.is_enabled() {
        let record = ReportStatistics {
            entity: entity.clone(),
            report_type,
            status: ReportStatus::Pending,
            attempt,
            next_retry_at: None,
            last_error: existing.as_ref().and_then(|r| r.value.last_error.clone()),
            created_at,
            updated_at: now,
        };
        store.put(&key, record.clone(), existing.map(|r| r.version))?;
        return Ok(record);
    }

    match sink.send(entity, report_type, payload) {
        Ok(()) => {
            let record = ReportStatistics {
                entity: entity.clone(),
                report_type,
                status: ReportStatus::Succeeded,
                attempt: attempt + 1,
                next_retry_at: None,
                last_error: None,
                created_at,
                updated_at: now,
            };
            store.put(&key, record.clone(), existing.map(|r| r.version))?;
            Ok(record)
        }
        Err(e) => {
            let attempt = attempt + 1;
            let (status, next_retry_at) = if attempt >= MAX_ATTEMPTS {
                tracing::warn!(target: "rcx.reports.dispatch", %entity, ?report_type, attempt, "retries exhausted, disabling global sending");
                switch.disable();
                (ReportStatus::Pending, None)
            } else {
                (ReportStatus::Failed, Some(now + Duration::minutes(BACKOFF_UNIT_MINUTES * i64::from(attempt))))
            };
            let record = ReportStatistics {
                entity: entity.clone(),
                report_type,
                status,
                attempt,
                next_retry_at,
                last_error: Some(e.message.clone()),
                created_at,
                updated_at: now,
            };
            store.put(&key, record.clone(), existing.map(|r| r.version))?;
            Ok(record)
        }
    }
}

/// Outcome of one `retry_all` sweep.
#[derive(Debug, Clone, Default)]
pub struct RetryAllReport {
    /// `(entity, report_type)` pairs successfully redelivered.
    pub succeeded: Vec<(TenantKey, ReportType)>,
    /// Pairs marked `DUPLICATE` because an earlier pair in this sweep
    /// already covered the same `(entity, report_type)`.
    pub duplicates: Vec<(TenantKey, ReportType)>,
}

/// Re-dispatch every `PENDING` record whose retry is due, deduplicating by
/// `(entity, report_type)` — a later duplicate in the same sweep is marked
/// `DUPLICATE` instead of re-sent.
///
/// # Errors
///
/// Returns an error if the backing store cannot be read or written to.
pub fn retry_all(
    store: &dyn RecordStore<ReportStatistics>,
    sink: &dyn ReportSink,
    switch: &GlobalSendingSwitch,
    payload_for: impl Fn(&TenantKey, ReportType) -> Vec<u8>,
    now: DateTime<Utc>,
) -> CoreResult<RetryAllReport> {
    let mut report = RetryAllReport::default();
    let mut seen: BTreeSet<(String, ReportType)> = BTreeSet::new();

    for key in store.scan_prefix("")? {
        let Some(record) = store.get(&key)? else {
            continue;
        };
        let version = record.version;
        let pending = record.value;
        if pending.status != ReportStatus::Pending && pending.status != ReportStatus::Failed {
            continue;
        }
        if let Some(next_retry_at) = pending.next_retry_at {
            if next_retry_at > now {
                continue;
            }
        }

        let dedup_key = (pending.entity.scan_prefix(), pending.report_type);
        if !seen.insert(dedup_key) {
            let mut duplicate = pending.clone();
            duplicate.status = ReportStatus::Duplicate;
            duplicate.updated_at = now;
            store.put(&key, duplicate, Some(version)).ok();
            report.duplicates.push((pending.entity, pending.report_type));
            continue;
        }

        let payload = payload_for(&pending.entity, pending.report_type);
        let redelivered = dispatch(store, sink, switch, &pending.entity, pending.report_type, &payload, now)?;
        if redelivered.status == ReportStatus::Succeeded {
            report.succeeded.push((pending.entity, pending.report_type));
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_core::{FindingStatus, ResourceIdentity};
    use rcx_ingest::{RulesSummary, StatisticsDocument};
    use rcx_store::InMemoryRecordStore;
    use std::sync::Mutex;

    fn resource(id: &str) -> ResourceIdentity {
        ResourceIdentity {
            id: id.to_string(),
            name: id.to_string(),
            resource_type: "s3_bucket".to_string(),
            location: "us-east-1".to_string(),
        }
    }

    fn document_with_one_failed_bucket(now: DateTime<Utc>) -> StatisticsDocument {
        StatisticsDocument {
            job_id: rcx_core::JobId::new(),
            per_rule: vec![rcx_ingest::RuleStatistics {
                rule_id: "s3-public-read".into(),
                region: "us-east-1".into(),
                status: FindingStatus::Failed,
                started_at: now,
                finished_at: now,
                resources_scanned: 1,
                elapsed_time_ms: 0,
                failed_resources: vec![resource("bucket-1")],
                error_kind: None,
                error_message: None,
            }],
            rules_summary: RulesSummary {
                total: 1,
                disabled: 0,
                passed: 0,
                failed: 1,
                failed_resource_samples: vec![resource("bucket-1")],
            },
            computed_at: now,
        }
    }

    #[test]
    fn exception_suppresses_matching_resource_from_report_view_only() {
        let now = Utc::now();
        let document = document_with_one_failed_bucket(now);
        let exception = ResourceException::ByIdentity {
            tenant: TenantKey::new("cust-1", "t1"),
            resource_type: "s3_bucket".into(),
            location: "us-east-1".into(),
            resource_id: "bucket-1".into(),
            expire_at: now + Duration::days(1),
        };

        let report_view = apply_exceptions(&document, &[exception], now);
        assert!(report_view.per_rule[0].failed_resources.is_empty());
        assert!(report_view.rules_summary.failed_resource_samples.is_empty());
        // Raw statistics are untouched — only the report view changed.
        assert_eq!(document.per_rule[0].failed_resources.len(), 1);
        assert_eq!(document.rules_summary.failed_resource_samples.len(), 1);
    }

    #[test]
    fn expired_exception_does_not_suppress() {
        let now = Utc::now();
        let document = document_with_one_failed_bucket(now);
        let expired = ResourceException::ByIdentity {
            tenant: TenantKey::new("cust-1", "t1"),
            resource_type: "s3_bucket".into(),
            location: "us-east-1".into(),
            resource_id: "bucket-1".into(),
            expire_at: now - Duration::minutes(1),
        };

        let report_view = apply_exceptions(&document, &[expired], now);
        assert_eq!(report_view.per_rule[0].failed_resources.len(), 1);
    }

    #[test]
    fn removing_the_exception_reintroduces_the_finding_identically() {
        let now = Utc::now();
        let document = document_with_one_failed_bucket(now);
        let exception = ResourceException::ByIdentity {
            tenant: TenantKey::new("cust-1", "t1"),
            resource_type: "s3_bucket".into(),
            location: "us-east-1".into(),
            resource_id: "bucket-1".into(),
            expire_at: now + Duration::days(1),
        };

        let with_exception = apply_exceptions(&document, &[exception], now);
        assert!(with_exception.per_rule[0].failed_resources.is_empty());

        let after_removal = apply_exceptions(&document, &[], now);
        assert_eq!(
            after_removal.per_rule[0].failed_resources[0].id,
            document.per_rule[0].failed_resources[0].id
        );
        assert_eq!(after_removal.rules_summary.failed_resource_samples.len(), document.rules_summary.failed_resource_samples.len());
    }

    struct FlakySink {
        fail_count: Mutex<u32>,
    }

    impl ReportSink for FlakySink {
        fn send(&self, _entity: &TenantKey, _report_type: ReportType, _payload: &[u8]) -> CoreResult<()> {
            let mut count = self.fail_count.lock().unwrap();
            if *count > 0 {
                *count -= 1;
                Err(CoreError::new(ErrorKind::UpstreamUnavailable, "sink unreachable"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn oversized_payload_fails_fast_without_touching_the_store() {
        let store: InMemoryRecordStore<ReportStatistics> = InMemoryRecordStore::new();
        let sink = FlakySink { fail_count: Mutex::new(0) };
        let switch = GlobalSendingSwitch::new();
        let entity = TenantKey::new("cust-1", "t1");
        let payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        let err = dispatch(&store, &sink, &switch, &entity, ReportType::Compliance, &payload, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(store.get(&report_key(&entity, ReportType::Compliance)).unwrap().is_none());
    }

    #[test]
    fn disabled_switch_parks_request_as_pending() {
        let store: InMemoryRecordStore<ReportStatistics> = InMemoryRecordStore::new();
        let sink = FlakySink { fail_count: Mutex::new(0) };
        let switch = GlobalSendingSwitch::new();
        switch.disable();
        let entity = TenantKey::new("cust-1", "t1");
        let record = dispatch(&store, &sink, &switch, &entity, ReportType::Operational, b"{}", Utc::now()).unwrap();
        assert_eq!(record.status, ReportStatus::Pending);
    }

    #[test]
    fn fourth_failure_disables_global_sending_and_parks() {
        let store: InMemoryRecordStore<ReportStatistics> = InMemoryRecordStore::new();
        let sink = FlakySink { fail_count: Mutex::new(10) };
        let switch = GlobalSendingSwitch::new();
        let entity = TenantKey::new("cust-1", "t1");
        let mut last = None;
        for _ in 0..MAX_ATTEMPTS {
            last = Some(dispatch(&store, &sink, &switch, &entity, ReportType::Findings, b"{}", Utc::now()).unwrap());
        }
        assert_eq!(last.unwrap().status, ReportStatus::Pending);
        assert!(!switch.is_enabled());
    }

    #[test]
    fn successful_send_marks_succeeded() {
        let store: InMemoryRecordStore<ReportStatistics> = InMemoryRecordStore::new();
        let sink = FlakySink { fail_count: Mutex::new(0) };
        let switch = GlobalSendingSwitch::new();
        let entity = TenantKey::new("cust-1", "t1");
        let record = dispatch(&store, &sink, &switch, &entity, ReportType::Digests, b"{}", Utc::now()).unwrap();
        assert_eq!(record.status, ReportStatus::Succeeded);
    }

    #[test]
    fn retry_all_dedups_by_entity_and_report_type() {
        let store: InMemoryRecordStore<ReportStatistics> = InMemoryRecordStore::new();
        let entity = TenantKey::new("cust-1", "t1");
        let now = Utc::now();
        let pending = ReportStatistics {
            entity: entity.clone(),
            report_type: ReportType::Errors,
            status: ReportStatus::Pending,
            attempt: 1,
            next_retry_at: None,
            last_error: Some("transient".into()),
            created_at: now,
            updated_at: now,
        };
        store.put(&report_key(&entity, ReportType::Errors), pending.clone(), None).unwrap();
        store.put("cust-1/t1/reports/dup", pending, None).unwrap();

        let sink = FlakySink { fail_count: Mutex::new(0) };
        let switch = GlobalSendingSwitch::new();
        let report = retry_all(&store, &sink, &switch, |_, _| b"{}".to_vec(), now).unwrap();
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.duplicates.len(), 1);
    }
}
