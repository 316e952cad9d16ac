// SPDX-License-Identifier: MIT OR Apache-2.0
//! S5 — scheduled job de-duplication: two scheduler replicas racing the
//! same `cron(*/1 * * * *)` entry against a shared store must never fire
//! the same nominal minute twice.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcx_core::{RuleSetId, ScheduledJob, TenantKey};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_scheduler::{scheduled_job_key, tick, JobSubmitter};
use rcx_store::{InMemoryRecordStore, RecordStore};
use std::sync::{Arc, Barrier, Mutex};

struct RecordingSubmitter {
    submitted: Mutex<Vec<String>>,
}

impl JobSubmitter for RecordingSubmitter {
    fn submit(&self, entry: &ScheduledJob) -> CoreResult<()> {
        self.submitted.lock().unwrap().push(entry.name.clone());
        Ok(())
    }
}

fn every_minute_entry() -> ScheduledJob {
    ScheduledJob {
        name: "nightly-drift-scan".to_string(),
        customer_id: "cust-1".to_string(),
        schedule_expr: "cron(*/1 * * * *)".to_string(),
        enabled: true,
        target_tenant: TenantKey::new("cust-1", "t1"),
        regions: vec!["us-east-1".to_string()],
        ruleset_ids: vec![RuleSetId::new()],
        last_fire_time: None,
    }
}

/// Two replicas race the tick loop at each of 10 successive nominal
/// minutes, released simultaneously by a barrier so both read the entry's
/// pre-fire state before either writes. The store's compare-and-set on
/// `last_fire_time` must let exactly one replica win each minute, so the
/// total fired count across both replicas over the 10 minutes is exactly
/// 10 — never 20, never fewer than 10.
#[test]
fn two_replicas_racing_ten_ticks_fire_exactly_ten_times() {
    let store = Arc::new(InMemoryRecordStore::<ScheduledJob>::new());
    let key = scheduled_job_key("cust-1", "nightly-drift-scan");
    store.put(&key, every_minute_entry(), None).unwrap();

    let total_fired = Arc::new(Mutex::new(0usize));
    let total_lost_races = Arc::new(Mutex::new(0usize));
    let start: DateTime<Utc> = Utc::now();

    for minute in 0..10 {
        let now = start + ChronoDuration::minutes(minute);
        let barrier = Arc::new(Barrier::new(2));

        fn run_replica(store: Arc<InMemoryRecordStore<ScheduledJob>>, barrier: Arc<Barrier>, now: DateTime<Utc>) -> (usize, usize) {
            let submitter = RecordingSubmitter { submitted: Mutex::new(vec![]) };
            barrier.wait();
            let report = tick(store.as_ref(), &submitter, now).unwrap();
            (report.fired.len(), report.lost_races.len())
        }

        let store_a = Arc::clone(&store);
        let barrier_a = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || run_replica(store_a, barrier_a, now));
        let (fired_b, lost_b) = run_replica(Arc::clone(&store), Arc::clone(&barrier), now);
        let (fired_a, lost_a) = handle.join().unwrap();

        assert_eq!(fired_a + fired_b, 1, "exactly one replica must win minute {minute}");
        assert_eq!(lost_a + lost_b, 1, "the loser must be reported in lost_races, not silently dropped");

        *total_fired.lock().unwrap() += fired_a + fired_b;
        *total_lost_races.lock().unwrap() += lost_a + lost_b;
    }

    assert_eq!(*total_fired.lock().unwrap(), 10);
    assert_eq!(*total_lost_races.lock().unwrap(), 10);
}

/// A store failure surfaces as an error rather than being swallowed —
/// `tick` only tolerates a single entry's unparsable schedule or lost CAS
/// race, not a broken backing store.
#[test]
fn store_failure_propagates() {
    struct BrokenStore;
    impl RecordStore<ScheduledJob> for BrokenStore {
        fn get(&self, _key: &str) -> CoreResult<Option<rcx_store::VersionedRecord<ScheduledJob>>> {
            Err(CoreError::new(ErrorKind::Internal, "disk offline"))
        }
        fn put(&self, _key: &str, _value: ScheduledJob, _expected_version: Option<u64>) -> CoreResult<u64> {
            unreachable!()
        }
        fn delete(&self, _key: &str) -> CoreResult<()> {
            unreachable!()
        }
        fn scan_prefix(&self, _prefix: &str) -> CoreResult<Vec<String>> {
            Ok(vec!["cust-1/scheduled_jobs/nightly-drift-scan".to_string()])
        }
    }

    let submitter = RecordingSubmitter { submitted: Mutex::new(vec![]) };
    let err = tick(&BrokenStore, &submitter, Utc::now()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Internal);
}
