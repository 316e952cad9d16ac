// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job execution pipeline.
//!
//! Drives an admitted job from `READY` through the Scan Worker Runtime,
//! Result Ingestor, Metrics Aggregator, and Report Dispatcher to a terminal
//! state. [`rcx_coordinator::admit`] only ever gets a job to `READY`; this
//! module is what actually runs it.

use crate::state::AppState;
use rcx_core::{IngestErrorKind, Job, JobId, JobState, ResourceIdentity, Rule, TenantKey};
use rcx_coordinator::cancel::CancellableJob;
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_ingest::{canonicalize, RawError, RawRegionRecord};
use rcx_reports::{apply_exceptions, dispatch, report_key, ReportSink, ReportType};
use rcx_store::BlobStore;
use rcx_worker::evaluator::ProcessPolicyEvaluator;
use rcx_worker::{result_key, ResultManifest, WorkerJob, WorkerRuntime};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Writes a dispatched report straight into blob storage under its
/// `(entity, report_type)` key — the single-node substitute for the
/// SIEM/webhook sinks a production deployment would target.
struct BlobReportSink<'a> {
    blobs: &'a dyn BlobStore,
}

impl ReportSink for BlobReportSink<'_> {
    fn send(&self, entity: &TenantKey, report_type: ReportType, payload: &[u8]) -> CoreResult<()> {
        self.blobs.put(&report_key(entity, report_type), payload)
    }
}

/// Drive `job_id` from `READY` to a terminal state and return the updated
/// record.
///
/// A policy evaluator crash or timeout is not an error here — it lands the
/// job in `FAILED`/`TIMED_OUT` and this still returns `Ok`. Only an unknown
/// job id, a job not in `READY`, or a backing-store failure errors.
///
/// # Errors
///
/// Returns [`ErrorKind::NotFound`] if `job_id` is unknown, [`ErrorKind::Conflict`]
/// if the job isn't `READY`, or propagates a record/blob store failure.
pub async fn run_job(state: &AppState, job_id: JobId) -> CoreResult<Job> {
    let record = state
        .jobs
        .get(&job_id.to_string())?
        .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("job not found: {job_id}")))?;
    let mut job = record.value;
    if job.state != JobState::Ready {
        return Err(CoreError::new(
            ErrorKind::Conflict,
            format!("job {job_id} is not ready to run (state: {:?})", job.state),
        ));
    }

    job.state = JobState::Running;
    job.started_at = Some(state.now());
    state.jobs.put(&job_id.to_string(), job.clone(), Some(record.version))?;

    let cancel = state.cancellations.register(job_id);
    let outcome = execute(state, &job, &cancel).await;
    state.cancellations.forget(job_id);

    let record = state
        .jobs
        .get(&job_id.to_string())?
        .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("job not found: {job_id}")))?;
    let mut job = record.value;
    if job.state.is_terminal() {
        // Cancelled out from under us via `force_cancel` while `execute` ran.
        return Ok(job);
    }

    match outcome {
        Ok((final_state, result_artifact_key, statistics_artifact_key)) => {
            job.state = final_state;
            job.result_artifact_key = result_artifact_key;
            job.statistics_artifact_key = statistics_artifact_key;
        }
        Err(e) => {
            tracing::error!(target: "rcx.daemon.pipeline", job_id = %job_id, error = %e, "job run failed");
            job.state = JobState::Failed;
            job.error_kind = Some(e.kind.as_str().to_string());
        }
    }
    job.ended_at = Some(state.now());
    state.jobs.put(&job_id.to_string(), job.clone(), Some(record.version))?;
    state.slot_store().release(&job.tenant)?;
    Ok(job)
}

async fn execute(state: &AppState, job: &Job, cancel: &CancellableJob) -> CoreResult<(JobState, Option<String>, Option<String>)> {
    let mut credential_env = BTreeMap::new();
    if let Some(secret_ref) = &job.credential_ref {
        let plaintext = state.secrets.unseal(secret_ref)?;
        credential_env.insert("RCX_CREDENTIALS".to_string(), plaintext);
    }

    let mut bundle = Vec::new();
    let mut rule_ids: BTreeSet<String> = BTreeSet::new();
    for ruleset_id in &job.ruleset_ids {
        let ruleset = state
            .rulesets
            .get(&ruleset_id.to_string())?
            .map(|r| r.value)
            .ok_or_else(|| CoreError::new(ErrorKind::NotFound, format!("ruleset not found: {ruleset_id}")))?;
        if let Some(key) = &ruleset.artifact_key {
            bundle.extend(state.blobs.get(key)?);
        }
        rule_ids.extend(ruleset.rule_ids.iter().cloned());
    }

    let worker_job = WorkerJob {
        job_id: job.id,
        bundle,
        credential_env,
        regions: job.regions.clone(),
        timeout: Duration::from_secs(state.worker_timeout_secs),
    };

    let evaluator = ProcessPolicyEvaluator::new(state.policy_evaluator_command.clone(), Vec::new());
    let work_dir = tempfile::tempdir().map_err(|e| CoreError::new(ErrorKind::Internal, format!("create scratch dir: {e}")))?;
    let runtime = WorkerRuntime::new(&evaluator, state.blobs.as_ref());
    let manifest = runtime.run(&worker_job, work_dir.path(), cancel).await?;

    let now = state.now();
    let mut records = read_raw_records(state, job.id, &manifest)?;
    if !manifest.complete {
        synthesize_unfinished_rule_errors(&mut records, &rule_ids, &job.regions, &manifest, now);
    }
    let doc = canonicalize(job.id, &records, rule_ids.len(), 0, now);

    let statistics_key = format!("statistics/{}.json", job.id);
    let doc_bytes =
        serde_json::to_vec_pretty(&doc).map_err(|e| CoreError::new(ErrorKind::Internal, format!("serialize statistics: {e}")))?;
    state.blobs.put(&statistics_key, &doc_bytes)?;

    let rules: BTreeMap<String, Rule> = rule_ids
        .iter()
        .filter_map(|id| state.rules.get(id).ok().flatten().map(|r| (id.clone(), r.value)))
        .collect();
    let mut aggregator = rcx_metrics::MetricAggregator::new();
    aggregator.add(&doc, &rules, now);
    let snapshot_key = rcx_metrics::snapshot_key(&job.tenant, now.date_naive());
    let previous = state.metric_snapshots.get(&snapshot_key)?.map(|r| r.value);
    let snapshot = aggregator.finish(job.tenant.clone(), now, previous.as_ref());
    rcx_metrics::put_snapshot(state.metric_snapshots.as_ref(), &snapshot)?;

    // No tenant has a way to register resource exceptions yet, so every
    // report ships unfiltered for now.
    let report_doc = apply_exceptions(&doc, &[], now);
    let report_bytes =
        serde_json::to_vec_pretty(&report_doc).map_err(|e| CoreError::new(ErrorKind::Internal, format!("serialize report: {e}")))?;
    let sink = BlobReportSink { blobs: state.blobs.as_ref() };
    dispatch(
        state.report_statistics.as_ref(),
        &sink,
        &state.sending_switch,
        &job.tenant,
        ReportType::Findings,
        &report_bytes,
        now,
    )?;

    let final_state = if manifest.timed_out {
        JobState::TimedOut
    } else if manifest.complete {
        JobState::Succeeded
    } else {
        JobState::Failed
    };
    let result_artifact_key = Some(format!("results/{}/manifest.json", job.id));
    Ok((final_state, result_artifact_key, Some(statistics_key)))
}

/// Read a worker's archived `(region, policy)` output tree back as raw
/// ingestion records. Each archived policy corresponds to exactly one
/// compiled rule, since the Ruleset Compiler assembles one policy per rule.
fn read_raw_records(state: &AppState, job_id: JobId, manifest: &ResultManifest) -> CoreResult<Vec<RawRegionRecord>> {
    let mut records = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        let resources_bytes = state.blobs.get(&result_key(job_id, &entry.region, &entry.policy_name, "resources.json"))?;
        let resources: Vec<ResourceIdentity> = serde_json::from_slice(&resources_bytes)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("parse resources.json: {e}")))?;

        let errors_key = result_key(job_id, &entry.region, &entry.policy_name, "errors.log");
        let error = if state.blobs.exists(&errors_key)? {
            let bytes = state.blobs.get(&errors_key)?;
            Some(RawError {
                kind: IngestErrorKind::Internal,
                message: String::from_utf8_lossy(&bytes).into_owned(),
            })
        } else {
            None
        };

        records.push(RawRegionRecord {
            rule_id: entry.policy_name.clone(),
            region: entry.region.clone(),
            resources,
            error,
            started_at: manifest.archived_at,
            finished_at: manifest.archived_at,
        });
    }
    Ok(records)
}

/// Fill in an `INTERNAL` error record for every `(rule, region)` pair the
/// evaluator never reported back, so a timeout or crash still leaves the
/// unfinished rules visible in the job's statistics instead of silently
/// dropping them.
fn synthesize_unfinished_rule_errors(
    records: &mut Vec<RawRegionRecord>,
    rule_ids: &BTreeSet<String>,
    regions: &[String],
    manifest: &ResultManifest,
    now: chrono::DateTime<chrono::Utc>,
) {
    let covered: BTreeSet<(String, String)> = records.iter().map(|r| (r.rule_id.clone(), r.region.clone())).collect();
    let reason = manifest
        .failure_reason
        .clone()
        .unwrap_or_else(|| "job did not complete".to_string());
    for rule_id in rule_ids {
        for region in regions {
            if covered.contains(&(rule_id.clone(), region.clone())) {
                continue;
            }
            records.push(RawRegionRecord {
                rule_id: rule_id.clone(),
                region: region.clone(),
                resources: Vec::new(),
                error: Some(RawError {
                    kind: IngestErrorKind::Internal,
                    message: reason.clone(),
                }),
                started_at: now,
                finished_at: now,
            });
        }
    }
}
