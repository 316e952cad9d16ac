// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scheduler: maintains enabled [`ScheduledJob`] entries and fires them
//! at-most-once per nominal fire time via a compare-and-set tick loop.

pub mod expr;

use chrono::{DateTime, Utc};
use expr::{next_fire_after, parse_schedule};
use rcx_core::ScheduledJob;
#[cfg(test)]
use rcx_error::CoreError;
use rcx_error::{CoreResult, ErrorKind};
use rcx_store::RecordStore;

/// Submits a job on behalf of a fired [`ScheduledJob`].
///
/// Implementations typically build a `Submission` from the entry and hand
/// it to the Job Coordinator's `admit`.
pub trait JobSubmitter {
    /// Submit a job for `entry`. A failure here is logged by the tick loop
    /// and does not block subsequent entries from firing.
    fn submit(&self, entry: &ScheduledJob) -> CoreResult<()>;
}

/// Outcome of one tick across every enabled entry.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Names of entries that fired successfully this tick.
    pub fired: Vec<String>,
    /// `(name, error message)` for entries whose submission failed.
    pub submission_failures: Vec<(String, String)>,
    /// Entries skipped because another scheduler already claimed this fire.
    pub lost_races: Vec<String>,
}

/// Run one tick: for every enabled entry whose next nominal fire time is
/// due, CAS `last_fire_time` before submitting, so two schedulers racing on
/// the same entry fire it at most once.
///
/// # Errors
///
/// Returns an error only if the backing store itself cannot be read.
pub fn tick(store: &dyn RecordStore<ScheduledJob>, submitter: &dyn JobSubmitter, now: DateTime<Utc>) -> CoreResult<TickReport> {
    let mut report = TickReport::default();
    for key in store.scan_prefix("")? {
        let Some(record) = store.get(&key)? else {
            continue;
        };
        let entry = record.value;
        if !entry.enabled {
            continue;
        }

        let schedule = match parse_schedule(&entry.schedule_expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(target: "rcx.scheduler.tick", name = %entry.name, error = %e, "skipping entry with unparsable schedule");
                continue;
            }
        };

        let baseline = entry.last_fire_time.unwrap_or(entry_epoch());
        let next_fire = match next_fire_after(&schedule, baseline) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(target: "rcx.scheduler.tick", name = %entry.name, error = %e, "skipping entry with unsatisfiable schedule");
                continue;
            }
        };
        if next_fire > now {
            continue;
        }

        let mut fired_entry = entry.clone();
        fired_entry.last_fire_time = Some(next_fire);
        match store.put(&key, fired_entry.clone(), Some(record.version)) {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::Conflict => {
                report.lost_races.push(entry.name.clone());
                continue;
            }
            Err(e) => return Err(e),
        }

        match submitter.submit(&fired_entry) {
            Ok(()) => report.fired.push(entry.name.clone()),
            Err(e) => {
                tracing::warn!(target: "rcx.scheduler.tick", name = %entry.name, error = %e, "scheduled submission failed");
                report.submission_failures.push((entry.name.clone(), e.message.clone()));
            }
        }
    }
    Ok(report)
}

fn entry_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(0, 0).unwrap_or_else(Utc::now)
}

/// Record-store key for one scheduled job entry.
#[must_use]
pub fn scheduled_job_key(customer_id: &str, name: &str) -> String {
    format!("{customer_id}/scheduled_jobs/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_core::{RuleSetId, TenantKey};
    use rcx_store::InMemoryRecordStore;
    use std::sync::Mutex;

    struct RecordingSubmitter {
        submitted: Mutex<Vec<String>>,
        fail_next: bool,
    }

    impl JobSubmitter for RecordingSubmitter {
        fn submit(&self, entry: &ScheduledJob) -> CoreResult<()> {
            if self.fail_next {
                return Err(CoreError::new(ErrorKind::Internal, "boom"));
            }
            self.submitted.lock().unwrap().push(entry.name.clone());
            Ok(())
        }
    }

    fn entry(name: &str, expr: &str, last_fire: Option<DateTime<Utc>>) -> ScheduledJob {
        ScheduledJob {
            name: name.to_string(),
            customer_id: "cust-1".to_string(),
            schedule_expr: expr.to_string(),
            enabled: true,
            target_tenant: TenantKey::new("cust-1", "t1"),
            regions: vec!["us-east-1".to_string()],
            ruleset_ids: vec![RuleSetId::new()],
            last_fire_time: last_fire,
        }
    }

    #[test]
    fn due_entry_fires_exactly_once_per_tick() {
        let store: InMemoryRecordStore<ScheduledJob> = InMemoryRecordStore::new();
        let key = scheduled_job_key("cust-1", "nightly");
        store.put(&key, entry("nightly", "rate(5 minutes)", None), None).unwrap();

        let submitter = RecordingSubmitter {
            submitted: Mutex::new(vec![]),
            fail_next: false,
        };
        let now = Utc::now();
        let report = tick(&store, &submitter, now).unwrap();
        assert_eq!(report.fired, vec!["nightly".to_string()]);
        assert_eq!(submitter.submitted.lock().unwrap().len(), 1);
    }

    #[test]
    fn entry_not_yet_due_does_not_fire() {
        let store: InMemoryRecordStore<ScheduledJob> = InMemoryRecordStore::new();
        let now = Utc::now();
        let key = scheduled_job_key("cust-1", "nightly");
        store.put(&key, entry("nightly", "rate(60 minutes)", Some(now)), None).unwrap();

        let submitter = RecordingSubmitter {
            submitted: Mutex::new(vec![]),
            fail_next: false,
        };
        let report = tick(&store, &submitter, now + chrono::Duration::minutes(1)).unwrap();
        assert!(report.fired.is_empty());
    }

    #[test]
    fn disabled_entry_never_fires() {
        let store: InMemoryRecordStore<ScheduledJob> = InMemoryRecordStore::new();
        let mut disabled = entry("nightly", "rate(1 minutes)", None);
        disabled.enabled = false;
        let key = scheduled_job_key("cust-1", "nightly");
        store.put(&key, disabled, None).unwrap();

        let submitter = RecordingSubmitter {
            submitted: Mutex::new(vec![]),
            fail_next: false,
        };
        let report = tick(&store, &submitter, Utc::now()).unwrap();
        assert!(report.fired.is_empty());
    }

    #[test]
    fn failing_submission_does_not_block_report_and_is_recorded() {
        let store: InMemoryRecordStore<ScheduledJob> = InMemoryRecordStore::new();
        let key = scheduled_job_key("cust-1", "nightly");
        store.put(&key, entry("nightly", "rate(1 minutes)", None), None).unwrap();

        let submitter = RecordingSubmitter {
            submitted: Mutex::new(vec![]),
            fail_next: true,
        };
        let report = tick(&store, &submitter, Utc::now()).unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.submission_failures.len(), 1);
    }

    #[test]
    fn firing_persists_last_fire_time_so_the_next_tick_does_not_refire() {
        let store: InMemoryRecordStore<ScheduledJob> = InMemoryRecordStore::new();
        let key = scheduled_job_key("cust-1", "nightly");
        store.put(&key, entry("nightly", "rate(5 minutes)", None), None).unwrap();

        let submitter = RecordingSubmitter {
            submitted: Mutex::new(vec![]),
            fail_next: false,
        };
        let now = Utc::now();
        tick(&store, &submitter, now).unwrap();
        let second_report = tick(&store, &submitter, now).unwrap();
        assert!(second_report.fired.is_empty());
        assert_eq!(submitter.submitted.lock().unwrap().len(), 1);
    }
}
