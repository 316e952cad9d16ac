// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command handlers: thin wrappers that turn a validated JSON payload into
//! a call against the core crates and a JSON result.
//!
//! None of these talk HTTP. A handler here and the equivalent `rcx-daemon`
//! route both end at the same `rcx-coordinator`/`rcx-ruleset`/`rcx-license`
//! calls; this crate just skips the wire hop.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rcx_core::{CloudKind, JobId, TenantKey};
use rcx_daemon::state::AppState;
use rcx_ruleset::{CompileOptions, RuleSelector};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::registry::{CommandKey, CommandRegistry, CommandSpec};

/// Build the full command table for the representative slice of groups
/// this crate implements a real core-crate path for. Groups named in the
/// wire contract but backed by nothing here (`integrations`, `platform`,
/// `user`, `policy`, `role`, `setting`, `customer`, `login`) are left
/// unregistered rather than stubbed with a fake success.
#[must_use]
pub fn build_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();

    registry.register(CommandSpec {
        key: CommandKey::new("job", "", "submit"),
        summary: "submit a scan job against a tenant",
        schema: || schema_json::<SubmitJobRequest>(),
        handler: submit_job,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "", "get"),
        summary: "fetch a job by id",
        schema: || schema_json::<JobIdRequest>(),
        handler: get_job,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "", "list"),
        summary: "list jobs for a tenant, most recent first",
        schema: || schema_json::<TenantRequest>(),
        handler: list_jobs,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "", "cancel"),
        summary: "request cooperative cancellation of a running job",
        schema: || schema_json::<JobIdRequest>(),
        handler: cancel_job,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "", "run"),
        summary: "run a ready job to completion, through evaluation, ingestion, metrics, and report dispatch",
        schema: || schema_json::<JobIdRequest>(),
        handler: run_job,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "scheduled", "register"),
        summary: "register or update a scheduled job entry",
        schema: || schema_json::<RegisterScheduledJobRequest>(),
        handler: register_scheduled_job,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("job", "scheduled", "tick"),
        summary: "run one scheduler tick, firing due entries",
        schema: || schema_json::<EmptyRequest>(),
        handler: tick_scheduled_jobs,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("ruleset", "", "compile"),
        summary: "compile a rule selector into a ready ruleset bundle",
        schema: || schema_json::<CompileRulesetRequest>(),
        handler: compile_ruleset,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("license", "", "show"),
        summary: "show the active license this deployment operates under",
        schema: || schema_json::<EmptyRequest>(),
        handler: show_license,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("tenant", "", "create"),
        summary: "register a new tenant",
        schema: || schema_json::<CreateTenantRequest>(),
        handler: create_tenant,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("tenant", "", "show"),
        summary: "show a tenant by key",
        schema: || schema_json::<TenantRequest>(),
        handler: show_tenant,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("meta", "", "whoami"),
        summary: "print the identity this CLI is currently configured as",
        schema: || schema_json::<EmptyRequest>(),
        handler: whoami,
    });
    registry.register(CommandSpec {
        key: CommandKey::new("meta", "", "health_check"),
        summary: "verify the record stores are reachable",
        schema: || schema_json::<EmptyRequest>(),
        handler: health_check,
    });

    registry
}

fn schema_json<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(serde_json::Value::Null)
}

fn parse<T: for<'de> Deserialize<'de>>(payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload).context("decoding command payload")
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EmptyRequest {}

#[derive(Debug, Deserialize, JsonSchema)]
struct JobIdRequest {
    /// Job id (UUID) to operate on.
    job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TenantRequest {
    /// Owning customer id.
    customer_id: String,
    /// Tenant name within that customer.
    tenant_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SubmitJobRequest {
    customer_id: String,
    tenant_name: String,
    cloud: CloudKind,
    regions: Vec<String>,
    selector: RuleSelector,
    submitter: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RegisterScheduledJobRequest {
    name: String,
    customer_id: String,
    schedule_expr: String,
    enabled: bool,
    target_customer_id: String,
    target_tenant_name: String,
    regions: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CompileRulesetRequest {
    cloud: CloudKind,
    selector: RuleSelector,
    name: String,
    excluded_rules: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateTenantRequest {
    customer_id: String,
    tenant_name: String,
    cloud: CloudKind,
    native_account_id: String,
    activated_regions: Vec<String>,
    display_name: String,
}

#[derive(Debug, Serialize)]
struct HealthCheckResult {
    status: &'static str,
    tenants_reachable: bool,
    jobs_reachable: bool,
}

fn submit_job(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: SubmitJobRequest = parse(payload)?;
    let submission = rcx_coordinator::Submission {
        tenant: TenantKey::new(req.customer_id, req.tenant_name),
        cloud: req.cloud,
        regions: req.regions,
        selector: req.selector,
        submitter: req.submitter,
        explicit_credentials: None,
        tenant_binding_credentials: None,
        submitter_environment_credentials: None,
    };
    let job = state.with_admission(|ctx| rcx_coordinator::admit(ctx, submission))?;
    Ok(serde_json::to_value(job)?)
}

fn get_job(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: JobIdRequest = parse(payload)?;
    let job_id = parse_job_id(&req.job_id)?;
    let job = state.require_job(job_id)?;
    Ok(serde_json::to_value(job)?)
}

fn list_jobs(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: TenantRequest = parse(payload)?;
    let tenant = TenantKey::new(req.customer_id, req.tenant_name);
    let jobs = state.jobs_for_tenant(&tenant)?;
    Ok(serde_json::to_value(jobs)?)
}

fn cancel_job(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: JobIdRequest = parse(payload)?;
    let job_id = parse_job_id(&req.job_id)?;
    let slots = state.slot_store();
    rcx_coordinator::force_cancel(state.jobs.as_ref(), &slots, job_id)?;
    Ok(serde_json::json!({ "job_id": job_id.to_string() }))
}

fn register_scheduled_job(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: RegisterScheduledJobRequest = parse(payload)?;
    rcx_scheduler::expr::parse_schedule(&req.schedule_expr).context("invalid schedule expression")?;
    let entry = rcx_core::ScheduledJob {
        name: req.name.clone(),
        customer_id: req.customer_id.clone(),
        schedule_expr: req.schedule_expr,
        enabled: req.enabled,
        target_tenant: TenantKey::new(req.target_customer_id, req.target_tenant_name),
        regions: req.regions,
        ruleset_ids: Vec::new(),
        last_fire_time: None,
    };
    let key = rcx_scheduler::scheduled_job_key(&req.customer_id, &req.name);
    let existing_version = lookup_scheduled_job_version(state, &key)?;
    state.scheduled_jobs.put(&key, entry.clone(), existing_version)?;
    Ok(serde_json::to_value(entry)?)
}

fn lookup_scheduled_job_version(state: &AppState, key: &str) -> Result<Option<u64>> {
    Ok(state.scheduled_jobs.get(key)?.map(|r| r.version))
}

fn tick_scheduled_jobs(state: &AppState, _payload: serde_json::Value) -> Result<serde_json::Value> {
    let report = rcx_daemon::scheduler::tick(state, Utc::now())?;
    Ok(serde_json::json!({
        "fired": report.fired,
        "submission_failures": report.submission_failures,
        "lost_races": report.lost_races,
    }))
}

fn run_job(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: JobIdRequest = parse(payload)?;
    let job_id = parse_job_id(&req.job_id)?;
    let runtime = tokio::runtime::Runtime::new().context("building async runtime for job run")?;
    let job = runtime.block_on(rcx_daemon::pipeline::run_job(state, job_id))?;
    Ok(serde_json::to_value(job)?)
}

fn compile_ruleset(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: CompileRulesetRequest = parse(payload)?;
    let options = CompileOptions {
        excluded_rules: req.excluded_rules.unwrap_or_default().into_iter().collect(),
        license_allowed: None,
        license_key: None,
        name: req.name,
    };
    let ruleset = rcx_ruleset::compile(
        req.cloud,
        &req.selector,
        &options,
        state.rules.as_ref(),
        state.rulesets.as_ref(),
        state.blobs.as_ref(),
    )?;
    Ok(serde_json::to_value(ruleset)?)
}

fn show_license(state: &AppState, _payload: serde_json::Value) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(&state.license)?)
}

fn create_tenant(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: CreateTenantRequest = parse(payload)?;
    let now = Utc::now();
    let tenant = rcx_core::Tenant {
        customer_id: req.customer_id,
        tenant_name: req.tenant_name,
        cloud: req.cloud,
        native_account_id: req.native_account_id,
        activated_regions: req.activated_regions.into_iter().collect(),
        excluded_rules: Default::default(),
        included_rules: Default::default(),
        display_name: req.display_name,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    state.tenants.put(&tenant.key().scan_prefix(), tenant.clone(), None)?;
    Ok(serde_json::to_value(tenant)?)
}

fn show_tenant(state: &AppState, payload: serde_json::Value) -> Result<serde_json::Value> {
    let req: TenantRequest = parse(payload)?;
    let tenant = TenantKey::new(req.customer_id, req.tenant_name);
    let found = state.require_tenant(&tenant)?;
    Ok(serde_json::to_value(found)?)
}

fn whoami(state: &AppState, _payload: serde_json::Value) -> Result<serde_json::Value> {
    Ok(serde_json::json!({ "customer_id": state.license.customer_id, "license_key": state.license.license_key.to_string() }))
}

fn health_check(state: &AppState, _payload: serde_json::Value) -> Result<serde_json::Value> {
    let tenants_reachable = state.tenants.scan_prefix("").is_ok();
    let jobs_reachable = state.jobs.scan_prefix("").is_ok();
    let status = if tenants_reachable && jobs_reachable { "ok" } else { "degraded" };
    Ok(serde_json::to_value(HealthCheckResult {
        status,
        tenants_reachable,
        jobs_reachable,
    })?)
}

fn parse_job_id(raw: &str) -> Result<JobId> {
    let uuid = uuid::Uuid::parse_str(raw).map_err(|_| anyhow!("malformed job id: {raw}"))?;
    Ok(JobId(uuid))
}
