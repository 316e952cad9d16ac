// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared daemon state: every record store, blob store, and collaborator
//! the HTTP handlers need, wired once at startup.

use chrono::Utc;
use rcx_core::{Job, License, MetricSnapshot, Rule, RuleSet, ScheduledJob, Tenant};
use rcx_coordinator::cancel::CancellationRegistry;
use rcx_coordinator::slot::{TenantSlotRecord, TenantSlotStore};
use rcx_coordinator::AdmissionContext;
use rcx_credentials::{default_chain, CredentialSource};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_license::SealedKeyLicenseManager;
use rcx_reports::{GlobalSendingSwitch, ReportStatistics};
use rcx_secrets::{SecretBroker, SecretRef};
use rcx_store::{BlobStore, RecordStore};
use std::path::Path;

/// Everything the control plane needs to admit, inspect, and cancel jobs.
pub struct AppState {
    /// Tenant registry.
    pub tenants: Box<dyn RecordStore<Tenant>>,
    /// Job records.
    pub jobs: Box<dyn RecordStore<Job>>,
    /// Per-tenant concurrency slots.
    pub slots: Box<dyn RecordStore<TenantSlotRecord>>,
    /// Rule catalog.
    pub rules: Box<dyn RecordStore<Rule>>,
    /// Compiled rulesets.
    pub rulesets: Box<dyn RecordStore<RuleSet>>,
    /// Scheduled job entries.
    pub scheduled_jobs: Box<dyn RecordStore<ScheduledJob>>,
    /// Content-addressed artifact storage.
    pub blobs: Box<dyn BlobStore>,
    /// Active license this deployment operates under.
    pub license: License,
    /// Secret broker for credential sealing/unsealing and license signing.
    pub secrets: Box<dyn SecretBroker>,
    /// Reference to the runtime identity's signing key, sealed in `secrets`.
    pub identity_key_ref: SecretRef,
    /// Credential resolution chain, in precedence order.
    pub credential_chain: Vec<Box<dyn CredentialSource>>,
    /// Whether a tenant may run more than one job at a time.
    pub allow_simultaneous_jobs_per_tenant: bool,
    /// Cooperative-cancellation handles for jobs currently executing.
    pub cancellations: CancellationRegistry,
    /// Executable the worker spawns per region to evaluate a compiled policy bundle.
    pub policy_evaluator_command: String,
    /// Wall-clock budget for one job's evaluator invocation.
    pub worker_timeout_secs: u64,
    /// Per-tenant compliance snapshots rolled up by the Metrics Aggregator.
    pub metric_snapshots: Box<dyn RecordStore<MetricSnapshot>>,
    /// Delivery state for dispatched reports.
    pub report_statistics: Box<dyn RecordStore<ReportStatistics>>,
    /// Process-wide report sending kill switch.
    pub sending_switch: GlobalSendingSwitch,
}

impl AppState {
    /// Build daemon state backed by filesystem stores rooted at `data_dir`,
    /// the single-node development substitute for the Mongo/Vault/S3-backed
    /// production deployment `rcx-config` enumerates.
    ///
    /// # Errors
    ///
    /// Returns an error if any backing directory cannot be created.
    pub fn open_fs(
        data_dir: &Path,
        license: License,
        secrets: Box<dyn SecretBroker>,
        identity_key_ref: SecretRef,
        allow_simultaneous_jobs_per_tenant: bool,
        policy_evaluator_command: String,
        worker_timeout_secs: u64,
    ) -> CoreResult<Self> {
        use rcx_store::{FsBlobStore, FsRecordStore};

        Ok(Self {
            tenants: Box::new(FsRecordStore::new(data_dir.join("tenants"))?),
            jobs: Box::new(FsRecordStore::new(data_dir.join("jobs"))?),
            slots: Box::new(FsRecordStore::new(data_dir.join("slots"))?),
            rules: Box::new(FsRecordStore::new(data_dir.join("rules"))?),
            rulesets: Box::new(FsRecordStore::new(data_dir.join("rulesets"))?),
            scheduled_jobs: Box::new(FsRecordStore::new(data_dir.join("scheduled_jobs"))?),
            blobs: Box::new(FsBlobStore::new(data_dir.join("blobs"))),
            license,
            secrets,
            identity_key_ref,
            credential_chain: default_chain(),
            allow_simultaneous_jobs_per_tenant,
            cancellations: CancellationRegistry::new(),
            policy_evaluator_command,
            worker_timeout_secs,
            metric_snapshots: Box::new(FsRecordStore::new(data_dir.join("metric_snapshots"))?),
            report_statistics: Box::new(FsRecordStore::new(data_dir.join("report_statistics"))?),
            sending_switch: GlobalSendingSwitch::new(),
        })
    }

    /// Look up a tenant by key, translating a missing record into
    /// [`ErrorKind::NotFound`].
    pub fn require_tenant(&self, tenant: &rcx_core::TenantKey) -> CoreResult<Tenant> {
        self.tenants
            .get(&tenant.scan_prefix())?
            .map(|r| r.value)
            .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("tenant not found: {tenant}")))
    }

    /// Look up a job by id, translating a missing record into
    /// [`ErrorKind::NotFound`].
    pub fn require_job(&self, job_id: rcx_core::JobId) -> CoreResult<Job> {
        self.jobs
            .get(&job_id.to_string())?
            .map(|r| r.value)
            .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("job not found: {job_id}")))
    }

    /// All jobs submitted for `tenant`, most recent first.
    pub fn jobs_for_tenant(&self, tenant: &rcx_core::TenantKey) -> CoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for key in self.jobs.scan_prefix("")? {
            if let Some(record) = self.jobs.get(&key)? {
                if &record.value.tenant == tenant {
                    jobs.push(record.value);
                }
            }
        }
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(jobs)
    }

    /// Run `f` with an [`AdmissionContext`] borrowing from this state.
    ///
    /// The license manager is sealed-key backed and scoped to this single
    /// call: it borrows `self.secrets`, so it cannot outlive the closure.
    pub fn with_admission<R>(&self, f: impl FnOnce(&AdmissionContext<'_>) -> R) -> R {
        let license_manager = SealedKeyLicenseManager::new(
            self.secrets.as_ref(),
            self.identity_key_ref.clone(),
            self.license.job_quota_per_period,
        );
        let ctx = AdmissionContext {
            tenants: self.tenants.as_ref(),
            jobs: self.jobs.as_ref(),
            slots: TenantSlotStore::new(self.slots.as_ref()),
            rules: self.rules.as_ref(),
            rulesets: self.rulesets.as_ref(),
            blobs: self.blobs.as_ref(),
            license_manager: &license_manager,
            license: &self.license,
            secrets: self.secrets.as_ref(),
            credential_chain: &self.credential_chain,
            allow_simultaneous_jobs_per_tenant: self.allow_simultaneous_jobs_per_tenant,
        };
        f(&ctx)
    }

    /// A slot gate over this state's slot store, for cancellation paths
    /// that don't need a full admission context.
    #[must_use]
    pub fn slot_store(&self) -> TenantSlotStore<'_> {
        TenantSlotStore::new(self.slots.as_ref())
    }

    /// Current wall-clock time, factored out so tests can be deterministic
    /// if a fixed clock is ever substituted in.
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<Utc> {
        Utc::now()
    }
}
