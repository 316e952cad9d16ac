// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant concurrency gate: one non-terminal job per tenant, enforced by a
//! conditional write on a `TenantSlot` record.

use chrono::{DateTime, Utc};
use rcx_core::{JobId, TenantKey};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_store::RecordStore;
use serde::{Deserialize, Serialize};

/// The job currently holding a tenant's concurrency slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSlotRecord {
    /// The job holding the slot.
    pub job_id: JobId,
    /// Last time this slot was known to be alive (admission or heartbeat).
    pub touched_at: DateTime<Utc>,
}

/// Conditional-put concurrency gate keyed by `(customer, tenant)`.
pub struct TenantSlotStore<'a> {
    store: &'a dyn RecordStore<TenantSlotRecord>,
}

impl<'a> TenantSlotStore<'a> {
    /// Wrap a record store as a tenant slot gate.
    #[must_use]
    pub fn new(store: &'a dyn RecordStore<TenantSlotRecord>) -> Self {
        Self { store }
    }

    /// Acquire the slot for `tenant` on behalf of `job_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Busy`] if the tenant already holds a slot.
    pub fn acquire(&self, tenant: &TenantKey, job_id: JobId, now: DateTime<Utc>) -> CoreResult<()> {
        let key = tenant.scan_prefix();
        self.store
            .put(
                &key,
                TenantSlotRecord {
                    job_id,
                    touched_at: now,
                },
                None,
            )
            .map_err(|e| {
                if e.kind == ErrorKind::Conflict {
                    CoreError::new(ErrorKind::Busy, format!("tenant {tenant} already has a job in flight"))
                } else {
                    e
                }
            })?;
        Ok(())
    }

    /// Release the slot for `tenant`, regardless of which job held it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written to.
    pub fn release(&self, tenant: &TenantKey) -> CoreResult<()> {
        self.store.delete(&tenant.scan_prefix())
    }

    /// Current holder of `tenant`'s slot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    pub fn holder(&self, tenant: &TenantKey) -> CoreResult<Option<JobId>> {
        Ok(self.store.get(&tenant.scan_prefix())?.map(|r| r.value.job_id))
    }

    /// Sweep every held slot and release any whose `touched_at` is older
    /// than `ttl_secs`, returning the `(tenant, job_id)` pairs reclaimed.
    /// Reclaimed jobs should be transitioned to `TIMED_OUT` by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read or written.
    pub fn reclaim_expired(&self, prefix: &str, ttl_secs: i64, now: DateTime<Utc>) -> CoreResult<Vec<(String, JobId)>> {
        let mut reclaimed = Vec::new();
        for key in self.store.scan_prefix(prefix)? {
            let Some(record) = self.store.get(&key)? else {
                continue;
            };
            let age = (now - record.value.touched_at).num_seconds();
            if age >= ttl_secs {
                self.store.delete(&key)?;
                reclaimed.push((key, record.value.job_id));
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use rcx_store::InMemoryRecordStore;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![(0usize..3).prop_map(Op::Acquire), (0usize..3).prop_map(Op::Release),]
    }

    proptest! {
        /// Invariant 1, restated at the slot layer: after any sequence of
        /// acquire/release calls, each tenant holds at most one slot, and
        /// a tenant holds a slot iff its most recent successful operation
        /// was an acquire that hasn't since been released.
        #[test]
        fn at_most_one_slot_per_tenant(ops in prop::collection::vec(op_strategy(), 0..50)) {
            let store: InMemoryRecordStore<TenantSlotRecord> = InMemoryRecordStore::new();
            let gate = TenantSlotStore::new(&store);
            let mut model: BTreeMap<usize, JobId> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Acquire(t) => {
                        let tenant = TenantKey::new("cust-1", &format!("t{t}"));
                        let job_id = JobId::new();
                        match gate.acquire(&tenant, job_id, Utc::now()) {
                            Ok(()) => {
                                prop_assert!(!model.contains_key(&t), "acquire succeeded while model already held a slot for tenant {t}");
                                model.insert(t, job_id);
                            }
                            Err(e) => {
                                prop_assert_eq!(e.kind, ErrorKind::Busy);
                                prop_assert!(model.contains_key(&t), "acquire rejected but model has no holder for tenant {t}");
                            }
                        }
                    }
                    Op::Release(t) => {
                        let tenant = TenantKey::new("cust-1", &format!("t{t}"));
                        gate.release(&tenant).unwrap();
                        model.remove(&t);
                    }
                }
            }

            for t in 0..3 {
                let tenant = TenantKey::new("cust-1", &format!("t{t}"));
                let actual_holder = gate.holder(&tenant).unwrap();
                prop_assert_eq!(actual_holder, model.get(&t).copied());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_store::InMemoryRecordStore;

    #[test]
    fn acquire_rejects_second_job_for_same_tenant() {
        let store: InMemoryRecordStore<TenantSlotRecord> = InMemoryRecordStore::new();
        let gate = TenantSlotStore::new(&store);
        let tenant = TenantKey::new("cust-1", "t1");
        gate.acquire(&tenant, JobId::new(), Utc::now()).unwrap();
        let err = gate.acquire(&tenant, JobId::new(), Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[test]
    fn release_then_acquire_succeeds() {
        let store: InMemoryRecordStore<TenantSlotRecord> = InMemoryRecordStore::new();
        let gate = TenantSlotStore::new(&store);
        let tenant = TenantKey::new("cust-1", "t1");
        gate.acquire(&tenant, JobId::new(), Utc::now()).unwrap();
        gate.release(&tenant).unwrap();
        assert!(gate.acquire(&tenant, JobId::new(), Utc::now()).is_ok());
    }

    #[test]
    fn reclaim_expired_releases_stale_slots() {
        let store: InMemoryRecordStore<TenantSlotRecord> = InMemoryRecordStore::new();
        let gate = TenantSlotStore::new(&store);
        let tenant = TenantKey::new("cust-1", "t1");
        let job_id = JobId::new();
        let stale_time = Utc::now() - chrono::Duration::hours(4);
        gate.acquire(&tenant, job_id, stale_time).unwrap();
        let reclaimed = gate.reclaim_expired("", 3 * 3600, Utc::now()).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].1, job_id);
        assert!(gate.holder(&tenant).unwrap().is_none());
    }
}
