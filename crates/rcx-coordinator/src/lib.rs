// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Job Coordinator: the admission state machine, tenant concurrency gate,
//! and cooperative cancellation for jobs moving through
//! `SUBMITTED → RESERVED → READY → RUNNING → {terminal}`.

pub mod cancel;
pub mod slot;

use chrono::Utc;
use rcx_core::{CloudKind, Job, JobId, JobState, License, Tenant, TenantKey};
use rcx_credentials::{resolve_credentials, CredentialRequest, CredentialSource};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_license::LicenseManagerClient;
use rcx_ruleset::{compile, CompileOptions, RuleSelector};
use rcx_secrets::SecretBroker;
use rcx_store::{BlobStore, RecordStore};
use slot::TenantSlotStore;
use uuid::Uuid;

/// A new job request, before admission.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Tenant to scan on behalf of.
    pub tenant: TenantKey,
    /// Cloud to scan; must match the tenant's configured cloud.
    pub cloud: CloudKind,
    /// Regions in scope; must be a subset of the tenant's activated regions.
    pub regions: Vec<String>,
    /// How to select the rule set for this job.
    pub selector: RuleSelector,
    /// Caller identity.
    pub submitter: String,
    /// Explicit credentials attached directly to this submission, if any.
    pub explicit_credentials: Option<rcx_credentials::RawCredentials>,
    /// The tenant's registered credentials binding, if any.
    pub tenant_binding_credentials: Option<rcx_credentials::RawCredentials>,
    /// The submitter's environment credentials, usable only if policy allows.
    pub submitter_environment_credentials: Option<rcx_credentials::RawCredentials>,
}

/// Everything [`JobCoordinator::admit`] needs, borrowed for the call.
pub struct AdmissionContext<'a> {
    /// Tenant records.
    pub tenants: &'a dyn RecordStore<Tenant>,
    /// Job records.
    pub jobs: &'a dyn RecordStore<Job>,
    /// Tenant concurrency gate.
    pub slots: TenantSlotStore<'a>,
    /// Rule records, for ruleset compilation.
    pub rules: &'a dyn RecordStore<rcx_core::Rule>,
    /// Ruleset records.
    pub rulesets: &'a dyn RecordStore<rcx_core::RuleSet>,
    /// Bundle artifact storage.
    pub blobs: &'a dyn BlobStore,
    /// License Manager client.
    pub license_manager: &'a dyn LicenseManagerClient,
    /// The license covering this submission's customer.
    pub license: &'a License,
    /// Secret broker for sealing resolved credentials.
    pub secrets: &'a dyn SecretBroker,
    /// Credential resolution chain, in precedence order.
    pub credential_chain: &'a [Box<dyn CredentialSource>],
    /// Whether a tenant may hold more than one non-terminal job at a time.
    pub allow_simultaneous_jobs_per_tenant: bool,
}

/// Admit `submission`, running the full six-step procedure. Always returns
/// a [`Job`] — on any failure after the job record has been created, the
/// job is persisted in a terminal `Failed` state with `error_kind` set,
/// and the same error is also returned so callers can react immediately.
///
/// # Errors
///
/// Returns the classified error from whichever step failed. The error
/// carries the `job_id` as context once a job has been created.
pub fn admit(ctx: &AdmissionContext<'_>, submission: Submission) -> CoreResult<Job> {
    // 1. Validate tenant exists, cloud matches, regions are activated.
    let tenant = ctx
        .tenants
        .get(&submission.tenant.scan_prefix())?
        .map(|r| r.value)
        .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("tenant {} not found", submission.tenant)))?;
    if !tenant.is_active {
        return Err(CoreError::new(ErrorKind::Validation, format!("tenant {} is not active", submission.tenant)));
    }
    if tenant.cloud != submission.cloud {
        return Err(CoreError::new(
            ErrorKind::Validation,
            format!("submission cloud {} does not match tenant cloud {}", submission.cloud, tenant.cloud),
        ));
    }
    for region in &submission.regions {
        if !tenant.activated_regions.contains(region) {
            return Err(CoreError::new(
                ErrorKind::Validation,
                format!("region {region} is not activated for tenant {}", submission.tenant),
            ));
        }
    }

    let now = Utc::now();
    let job_id = JobId::new();
    let trace_id = Uuid::new_v4();
    let mut job = Job {
        id: job_id,
        tenant: submission.tenant.clone(),
        cloud: submission.cloud,
        regions: submission.regions.clone(),
        ruleset_ids: Vec::new(),
        license_key: ctx.license.license_key.clone(),
        submitter: submission.submitter.clone(),
        state: JobState::Submitted,
        error_kind: None,
        submitted_at: now,
        started_at: None,
        ended_at: None,
        result_artifact_key: None,
        statistics_artifact_key: None,
        credential_ref: None,
        attempt: 1,
        cancel_requested: false,
        trace_id,
    };
    ctx.jobs.put(&job_id.to_string(), job.clone(), None)?;

    // 2. Tenant-concurrency lock.
    if !ctx.allow_simultaneous_jobs_per_tenant {
        if let Err(e) = ctx.slots.acquire(&submission.tenant, job_id, now) {
            return fail(ctx, &mut job, e, false, false);
        }
    }
    job.state = JobState::Reserved;
    persist(ctx, &job)?;

    // 3. Resolve license & quota, reserving one unit.
    if let Err(e) = ctx.license_manager.reserve_job(ctx.license, &submission.tenant, now) {
        return fail(ctx, &mut job, e, false, true);
    }

    // 4. Resolve credentials and seal them into the broker.
    let credential_request = CredentialRequest {
        tenant: submission.tenant.clone(),
        explicit: submission.explicit_credentials,
        tenant_binding: submission.tenant_binding_credentials,
        submitter_environment: submission.submitter_environment_credentials,
    };
    let envelope = match resolve_credentials(ctx.credential_chain, &credential_request, ctx.secrets) {
        Ok(envelope) => envelope,
        Err(e) => return fail(ctx, &mut job, e, true, true),
    };
    tracing::debug!(target: "rcx.coordinator.admit", job_id = %job_id, source = ?envelope.source, "credentials resolved");
    job.credential_ref = Some(envelope.secret_ref);

    // 5. Trigger the Ruleset Compiler.
    let options = CompileOptions {
        excluded_rules: tenant.excluded_rules.clone(),
        license_allowed: if ctx.license.allowed_rulesets.is_empty() {
            None
        } else {
            Some(ctx.license.allowed_rulesets.clone())
        },
        license_key: Some(ctx.license.license_key.clone()),
        name: format!("{}-{}", submission.tenant, job_id),
    };
    let ruleset = match compile(submission.cloud, &submission.selector, &options, ctx.rules, ctx.rulesets, ctx.blobs) {
        Ok(r) => r,
        Err(e) => return fail(ctx, &mut job, e, true, true),
    };

    job.ruleset_ids = vec![ruleset.id];
    job.state = JobState::Ready;
    persist(ctx, &job)?;
    tracing::info!(target: "rcx.coordinator.admit", job_id = %job_id, tenant = %submission.tenant, "job ready for a worker");
    Ok(job)
}

fn persist(ctx: &AdmissionContext<'_>, job: &Job) -> CoreResult<()> {
    let current_version = ctx.jobs.get(&job.id.to_string())?.map(|r| r.version);
    ctx.jobs.put(&job.id.to_string(), job.clone(), current_version)?;
    Ok(())
}

fn fail(
    ctx: &AdmissionContext<'_>,
    job: &mut Job,
    error: CoreError,
    refund_license: bool,
    release_slot: bool,
) -> CoreResult<Job> {
    job.state = JobState::Failed;
    job.error_kind = Some(error.kind.as_str().to_string());
    job.ended_at = Some(Utc::now());
    let _ = persist(ctx, job);
    if refund_license {
        ctx.license_manager.refund_job(&job.tenant);
    }
    if release_slot {
        let _ = ctx.slots.release(&job.tenant);
    }
    tracing::warn!(target: "rcx.coordinator.admit", job_id = %job.id, kind = %error.kind, "admission failed");
    Err(error.with_context("job_id", job.id.to_string()))
}

/// Force-transition `job_id` to `Cancelled` after `cancel_grace` has
/// elapsed without the worker observing the cooperative checkpoint, and
/// release its tenant slot.
///
/// # Errors
///
/// Returns an error if the job cannot be read or written.
pub fn force_cancel(jobs: &dyn RecordStore<Job>, slots: &TenantSlotStore<'_>, job_id: JobId) -> CoreResult<()> {
    let Some(record) = jobs.get(&job_id.to_string())? else {
        return Ok(());
    };
    let mut job = record.value;
    if job.state.is_terminal() {
        return Ok(());
    }
    job.state = JobState::Cancelled;
    job.ended_at = Some(Utc::now());
    jobs.put(&job_id.to_string(), job.clone(), Some(record.version))?;
    slots.release(&job.tenant)?;
    tracing::info!(target: "rcx.coordinator.cancel", job_id = %job_id, "job force-cancelled after grace period");
    Ok(())
}

/// Janitor sweep: reclaim tenant slots whose holder has gone silent for
/// longer than `slot_ttl_secs`, marking each reclaimed job `TimedOut`.
///
/// # Errors
///
/// Returns an error if the slot store or job store cannot be read/written.
pub fn reclaim_expired_slots(jobs: &dyn RecordStore<Job>, slots: &TenantSlotStore<'_>, slot_ttl_secs: i64) -> CoreResult<usize> {
    let now = Utc::now();
    let reclaimed = slots.reclaim_expired("", slot_ttl_secs, now)?;
    for (_, job_id) in &reclaimed {
        if let Some(record) = jobs.get(&job_id.to_string())? {
            let mut job = record.value;
            if !job.state.is_terminal() {
                job.state = JobState::TimedOut;
                job.ended_at = Some(now);
                jobs.put(&job_id.to_string(), job, Some(record.version))?;
                tracing::warn!(target: "rcx.coordinator.janitor", job_id = %job_id, "slot reclaimed, job timed out");
            }
        }
    }
    Ok(reclaimed.len())
}
