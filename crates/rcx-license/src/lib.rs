// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! License Manager client and job-quota tracking.
//!
//! Quota is reserved *before* job admission and refunded if admission fails
//! anywhere downstream — the coordinator never holds a reservation past a
//! terminal outcome.

use chrono::{DateTime, Utc};
use rcx_core::{ActivationRecord, License, TenantKey};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_secrets::{SecretBroker, SecretRef};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::sync::Mutex;

/// Per-tenant reservation counters against a license's
/// `job_quota_per_period`.
///
/// One [`QuotaTracker`] is scoped to a single license; reservations reset
/// when the caller rolls over to a new billing period by constructing a
/// fresh tracker.
#[derive(Debug)]
pub struct QuotaTracker {
    job_quota_per_period: u32,
    reserved: Mutex<BTreeMap<TenantKey, AtomicU32>>,
}

impl QuotaTracker {
    /// Construct a tracker enforcing `job_quota_per_period` jobs per tenant
    /// per period.
    #[must_use]
    pub fn new(job_quota_per_period: u32) -> Self {
        Self {
            job_quota_per_period,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserve one job admission for `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::LicenseQuota`] if the tenant has already
    /// reserved `job_quota_per_period` jobs this period.
    pub fn reserve(&self, tenant: &TenantKey) -> CoreResult<u32> {
        let mut map = self.reserved.lock().expect("quota tracker lock poisoned");
        let counter = map.entry(tenant.clone()).or_insert_with(|| AtomicU32::new(0));
        let previous = counter.fetch_add(1, Relaxed);
        if previous >= self.job_quota_per_period {
            counter.fetch_sub(1, Relaxed);
            return Err(CoreError::new(
                ErrorKind::LicenseQuota,
                format!("tenant {tenant} has exhausted its job quota for this period"),
            ));
        }
        Ok(self.job_quota_per_period - previous - 1)
    }

    /// Release a reservation taken by [`QuotaTracker::reserve`], e.g. after
    /// admission failed for an unrelated reason.
    pub fn refund(&self, tenant: &TenantKey) {
        let map = self.reserved.lock().expect("quota tracker lock poisoned");
        if let Some(counter) = map.get(tenant) {
            counter.fetch_update(Relaxed, Relaxed, |v| Some(v.saturating_sub(1))).ok();
        }
    }

    /// Remaining reservable jobs for `tenant` this period.
    #[must_use]
    pub fn remaining(&self, tenant: &TenantKey) -> u32 {
        let map = self.reserved.lock().expect("quota tracker lock poisoned");
        let used = map.get(tenant).map_or(0, |c| c.load(Relaxed));
        self.job_quota_per_period.saturating_sub(used)
    }
}

/// Client contract with the external License Manager: activation, quota
/// checks, and signing with the runtime's own identity key.
pub trait LicenseManagerClient: Send + Sync {
    /// Activate `tenant` against `license`, recording the activation.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Forbidden`] if the license does not permit this
    /// tenant's customer, or [`ErrorKind::LicenseExpired`] if expired.
    fn activate(&self, license: &License, tenant: &TenantKey) -> CoreResult<ActivationRecord>;

    /// Check whether `tenant` may admit another job under `license` right
    /// now, without reserving it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::LicenseExpired`] if the license has expired.
    fn check_quota(&self, license: &License, tenant: &TenantKey) -> CoreResult<(bool, u32)>;

    /// Sign `payload` with the runtime's identity key, returning the
    /// signature bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if no signing key has been provisioned.
    fn sign(&self, payload: &[u8]) -> CoreResult<Vec<u8>>;

    /// Reserve one job admission for `tenant` under `license`, checking
    /// expiry first. Requested *before* job admission by the coordinator
    /// and refunded via [`LicenseManagerClient::refund_job`] if admission
    /// fails downstream.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::LicenseExpired`] or [`ErrorKind::LicenseQuota`].
    fn reserve_job(&self, license: &License, tenant: &TenantKey, now: DateTime<Utc>) -> CoreResult<u32>;

    /// Release a reservation taken by [`LicenseManagerClient::reserve_job`].
    fn refund_job(&self, tenant: &TenantKey);
}

/// Reference [`LicenseManagerClient`] backed by a [`SecretBroker`] holding
/// the runtime identity's private key material. Signatures are a
/// deterministic keyed digest, not a production signature scheme — the
/// real LM integration replaces this implementation wholesale.
pub struct SealedKeyLicenseManager<'a> {
    broker: &'a dyn SecretBroker,
    identity_key_ref: SecretRef,
    quota: QuotaTracker,
}

impl<'a> SealedKeyLicenseManager<'a> {
    /// Construct a client whose signing key is sealed behind `identity_key_ref`
    /// in `broker`, enforcing `job_quota_per_period` admissions per tenant.
    #[must_use]
    pub fn new(broker: &'a dyn SecretBroker, identity_key_ref: SecretRef, job_quota_per_period: u32) -> Self {
        Self {
            broker,
            identity_key_ref,
            quota: QuotaTracker::new(job_quota_per_period),
        }
    }

}

impl LicenseManagerClient for SealedKeyLicenseManager<'_> {
    fn activate(&self, license: &License, tenant: &TenantKey) -> CoreResult<ActivationRecord> {
        if license.customer_id != tenant.customer_id {
            return Err(CoreError::new(
                ErrorKind::Forbidden,
                format!("license {} is not issued to customer {}", license.license_key, tenant.customer_id),
            ));
        }
        if license.is_expired(Utc::now()) {
            return Err(CoreError::new(
                ErrorKind::LicenseExpired,
                format!("license {} expired at {}", license.license_key, license.valid_until),
            ));
        }
        tracing::info!(target: "rcx.license.activate", %tenant, license_key = %license.license_key, "tenant activated");
        Ok(ActivationRecord {
            activated_at: Utc::now(),
            reserved_jobs: 0,
        })
    }

    fn check_quota(&self, license: &License, tenant: &TenantKey) -> CoreResult<(bool, u32)> {
        if license.is_expired(Utc::now()) {
            return Err(CoreError::new(
                ErrorKind::LicenseExpired,
                format!("license {} expired at {}", license.license_key, license.valid_until),
            ));
        }
        let remaining = self.quota.remaining(tenant);
        Ok((remaining > 0, remaining))
    }

    fn sign(&self, payload: &[u8]) -> CoreResult<Vec<u8>> {
        let key = self.broker.unseal(&self.identity_key_ref)?;
        let mut keyed = key.into_bytes();
        keyed.extend_from_slice(payload);
        Ok(rcx_core::hash::sha256_hex(&keyed).into_bytes())
    }

    fn reserve_job(&self, license: &License, tenant: &TenantKey, now: DateTime<Utc>) -> CoreResult<u32> {
        if license.is_expired(now) {
            return Err(CoreError::new(
                ErrorKind::LicenseExpired,
                format!("license {} expired at {}", license.license_key, license.valid_until),
            ));
        }
        self.quota.reserve(tenant)
    }

    fn refund_job(&self, tenant: &TenantKey) {
        self.quota.refund(tenant);
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Reserve,
        Refund,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Reserve), Just(Op::Refund)]
    }

    proptest! {
        /// Invariant 3: for any sequence of reserve/refund calls against a
        /// single tenant, the number of currently-outstanding reservations
        /// never exceeds `job_quota_per_period`.
        #[test]
        fn reservations_never_exceed_quota(
            quota in 1u32..8,
            ops in prop::collection::vec(op_strategy(), 0..100),
        ) {
            let tracker = QuotaTracker::new(quota);
            let tenant = TenantKey::new("cust-1", "t1");
            let mut outstanding: u32 = 0;

            for op in ops {
                match op {
                    Op::Reserve => match tracker.reserve(&tenant) {
                        Ok(_) => outstanding += 1,
                        Err(e) => prop_assert_eq!(e.kind, ErrorKind::LicenseQuota),
                    },
                    Op::Refund => {
                        tracker.refund(&tenant);
                        outstanding = outstanding.saturating_sub(1);
                    }
                }
                prop_assert!(outstanding <= quota);
                prop_assert_eq!(tracker.remaining(&tenant), quota - outstanding);
            }
        }
    }
}
