// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scan Worker Runtime.
//!
//! Drives one job to completion: invokes the policy evaluator against a
//! scratch working directory, enforces the job's wall-clock timeout, and
//! archives the raw per-region, per-policy output tree into blob storage
//! under `results/{job_id}/{region}/{policy}/` so the Result Ingestion
//! pipeline can canonicalize it.

pub mod evaluator;

use chrono::Utc;
use evaluator::{EvaluationOutcome, EvaluationRequest, PolicyEvaluator, RegionOutput};
use rcx_coordinator::cancel::CancellableJob;
use rcx_core::JobId;
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_store::BlobStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Everything the runtime needs to drive one job's evaluator invocation.
pub struct WorkerJob {
    /// The job being scanned.
    pub job_id: JobId,
    /// Compiled policy bundle bytes.
    pub bundle: Vec<u8>,
    /// Sealed credential material, already unsealed to environment pairs.
    pub credential_env: BTreeMap<String, String>,
    /// Regions to evaluate.
    pub regions: Vec<String>,
    /// Wall-clock budget for the whole invocation.
    pub timeout: Duration,
}

/// One archived `(region, policy)` pairing, identifying where its three
/// files live under `results/{job_id}/`. The blob store has no prefix
/// listing, so this index is how the ingestion pipeline learns what to read
/// back after archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEntry {
    /// Region this entry covers.
    pub region: String,
    /// Policy this entry was produced by.
    pub policy_name: String,
}

/// A raw output tree ready for archival, plus whether the evaluator
/// completed normally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultManifest {
    /// Job this manifest covers.
    pub job_id: JobId,
    /// Whether every requested region produced output.
    pub complete: bool,
    /// Regions present in the archived tree.
    pub regions: Vec<String>,
    /// One entry per archived `(region, policy)` pairing.
    pub entries: Vec<ResultEntry>,
    /// Set when the invocation failed before finishing all regions.
    pub failure_reason: Option<String>,
    /// Set when `failure_reason` is specifically a wall-clock budget
    /// overrun rather than a crash, so the caller can distinguish
    /// `TIMED_OUT` from `FAILED`.
    pub timed_out: bool,
    /// Wall-clock timestamp the manifest was written.
    pub archived_at: chrono::DateTime<Utc>,
}

/// Runs evaluator invocations and archives their raw output.
pub struct WorkerRuntime<'a> {
    evaluator: &'a dyn PolicyEvaluator,
    blobs: &'a dyn BlobStore,
}

impl<'a> WorkerRuntime<'a> {
    /// Construct a runtime around an evaluator and a blob archive.
    #[must_use]
    pub fn new(evaluator: &'a dyn PolicyEvaluator, blobs: &'a dyn BlobStore) -> Self {
        Self { evaluator, blobs }
    }

    /// Run `job` to completion, archiving whatever output the evaluator
    /// produced even on timeout or crash, and return the manifest.
    ///
    /// # Errors
    ///
    /// Propagates blob-store write failures. A policy evaluator timeout or
    /// crash is *not* an error here — it is recorded in the manifest so the
    /// caller can transition the job to `TIMED_OUT` or `FAILED` itself.
    pub async fn run(&self, job: &WorkerJob, working_dir: &Path, cancel: &CancellableJob) -> CoreResult<ResultManifest> {
        let request = EvaluationRequest {
            bundle: job.bundle.clone(),
            credential_env: job.credential_env.clone(),
            regions: job.regions.clone(),
            working_dir: working_dir.to_path_buf(),
            timeout: job.timeout,
        };

        let (outcome, failure_reason, timed_out) = match self.evaluator.evaluate(&request, cancel).await {
            Ok(outcome) => (outcome, None, false),
            Err(e) if e.kind == ErrorKind::TimedOut => {
                tracing::warn!(target: "rcx.worker.runtime", job_id = %job.job_id, "evaluator timed out");
                (EvaluationOutcome::default(), Some(e.message), true)
            }
            Err(e) => {
                tracing::error!(target: "rcx.worker.runtime", job_id = %job.job_id, error = %e, "evaluator crashed");
                (EvaluationOutcome::default(), Some(e.message), false)
            }
        };

        let regions_covered: std::collections::BTreeSet<&str> =
            outcome.regions.iter().map(|r| r.region.as_str()).collect();
        let complete = failure_reason.is_none() && regions_covered.len() == job.regions.len();
        self.archive(job.job_id, &outcome).await?;

        let manifest = ResultManifest {
            job_id: job.job_id,
            complete,
            regions: regions_covered.into_iter().map(String::from).collect(),
            entries: outcome
                .regions
                .iter()
                .map(|r| ResultEntry {
                    region: r.region.clone(),
                    policy_name: r.policy_name.clone(),
                })
                .collect(),
            failure_reason,
            timed_out,
            archived_at: Utc::now(),
        };
        self.put_manifest(job.job_id, &manifest)?;
        Ok(manifest)
    }

    async fn archive(&self, job_id: JobId, outcome: &EvaluationOutcome) -> CoreResult<()> {
        for region in &outcome.regions {
            self.archive_region(job_id, region)?;
        }
        Ok(())
    }

    fn archive_region(&self, job_id: JobId, region: &RegionOutput) -> CoreResult<()> {
        let metadata_bytes = serde_json::to_vec_pretty(&region.metadata)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("serialize metadata: {e}")))?;
        self.blobs
            .put(&result_key(job_id, &region.region, &region.policy_name, "metadata.json"), &metadata_bytes)?;

        let resources_bytes = serde_json::to_vec(&region.resources)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("serialize resources: {e}")))?;
        self.blobs
            .put(&result_key(job_id, &region.region, &region.policy_name, "resources.json"), &resources_bytes)?;

        if let Some(errors) = &region.errors_log {
            self.blobs
                .put(&result_key(job_id, &region.region, &region.policy_name, "errors.log"), errors.as_bytes())?;
        }
        Ok(())
    }

    fn put_manifest(&self, job_id: JobId, manifest: &ResultManifest) -> CoreResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("serialize manifest: {e}")))?;
        self.blobs.put(&format!("results/{job_id}/manifest.json"), &bytes)
    }
}

/// Blob key for one file in one `(region, policy)` pairing's archived
/// output tree.
#[must_use]
pub fn result_key(job_id: JobId, region: &str, policy_name: &str, leaf: &str) -> String {
    format!("results/{job_id}/{region}/{policy_name}/{leaf}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use evaluator::{MockPolicyEvaluator, RegionMetadata};
    use rcx_store::FsBlobStore;

    fn canned_outcome() -> EvaluationOutcome {
        EvaluationOutcome {
            regions: vec![RegionOutput {
                region: "us-east-1".into(),
                policy_name: "s3-public-read".into(),
                metadata: RegionMetadata {
                    policy_name: "s3-public-read".into(),
                    policy_description: "flags public buckets".into(),
                    resource_type: "s3_bucket".into(),
                    output_dir: "/tmp".into(),
                },
                resources: vec![serde_json::json!({"id": "bucket-1"})],
                errors_log: None,
            }],
        }
    }

    #[tokio::test]
    async fn run_archives_successful_output_and_marks_complete() {
        let blob_dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(blob_dir.path());
        let evaluator = MockPolicyEvaluator { canned: canned_outcome() };
        let runtime = WorkerRuntime::new(&evaluator, &blobs);

        let job = WorkerJob {
            job_id: JobId::new(),
            bundle: b"AWS:r1\n".to_vec(),
            credential_env: BTreeMap::new(),
            regions: vec!["us-east-1".into()],
            timeout: Duration::from_secs(5),
        };
        let work_dir = tempfile::tempdir().unwrap();
        let manifest = runtime.run(&job, work_dir.path(), &CancellableJob::new()).await.unwrap();

        assert!(manifest.complete);
        assert_eq!(manifest.regions, vec!["us-east-1".to_string()]);
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].policy_name, "s3-public-read");
        assert!(blobs
            .exists(&result_key(job.job_id, "us-east-1", "s3-public-read", "resources.json"))
            .unwrap());
        assert!(blobs.exists(&format!("results/{}/manifest.json", job.job_id)).unwrap());
    }

    #[tokio::test]
    async fn run_marks_incomplete_on_evaluator_timeout() {
        use evaluator::{EvaluationRequest as Req, PolicyEvaluator as Eval};
        struct AlwaysTimesOut;
        #[async_trait::async_trait]
        impl Eval for AlwaysTimesOut {
            async fn evaluate(&self, _r: &Req, _c: &CancellableJob) -> CoreResult<EvaluationOutcome> {
                Err(CoreError::new(ErrorKind::TimedOut, "budget exceeded"))
            }
        }

        let blob_dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(blob_dir.path());
        let evaluator = AlwaysTimesOut;
        let runtime = WorkerRuntime::new(&evaluator, &blobs);

        let job = WorkerJob {
            job_id: JobId::new(),
            bundle: vec![],
            credential_env: BTreeMap::new(),
            regions: vec!["us-east-1".into()],
            timeout: Duration::from_millis(10),
        };
        let work_dir = tempfile::tempdir().unwrap();
        let manifest = runtime.run(&job, work_dir.path(), &CancellableJob::new()).await.unwrap();

        assert!(!manifest.complete);
        assert!(manifest.failure_reason.is_some());
        assert!(manifest.timed_out);
    }
}
