// SPDX-License-Identifier: MIT OR Apache-2.0
//! The opaque policy evaluator contract: the worker hands off a ruleset
//! bundle, sealed credentials, and a working directory, and reads back a
//! fixed output-tree shape per region per policy.

use async_trait::async_trait;
use rcx_coordinator::cancel::CancellableJob;
use rcx_error::{CoreError, CoreResult, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// One evaluator invocation.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// Policy bundle bytes, as assembled by the Ruleset Compiler.
    pub bundle: Vec<u8>,
    /// Cloud credentials, injected via environment only — never written to disk.
    pub credential_env: BTreeMap<String, String>,
    /// Regions to evaluate, in order.
    pub regions: Vec<String>,
    /// Working directory the evaluator reads/writes its output tree in.
    pub working_dir: PathBuf,
    /// Wall-clock budget for the whole invocation.
    pub timeout: Duration,
}

/// `metadata.json` contents for one region/policy pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionMetadata {
    /// Name of the policy that produced this output.
    pub policy_name: String,
    /// Human-readable description.
    pub policy_description: String,
    /// Resource type the policy inspects.
    pub resource_type: String,
    /// Directory this metadata was read from, recorded for traceability.
    pub output_dir: String,
}

/// Parsed output for one `(region, policy)` pairing. A job evaluating
/// several policies against a region produces one `RegionOutput` per
/// policy, read from its own subdirectory of the region's working
/// directory.
#[derive(Debug, Clone)]
pub struct RegionOutput {
    /// The region this output covers.
    pub region: String,
    /// The policy this output was produced by.
    pub policy_name: String,
    /// Parsed `metadata.json`.
    pub metadata: RegionMetadata,
    /// Parsed `resources.json`, or empty if absent.
    pub resources: Vec<serde_json::Value>,
    /// Raw `errors.log` contents, if present.
    pub errors_log: Option<String>,
}

/// Full result of one evaluator invocation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// One entry per region that produced output.
    pub regions: Vec<RegionOutput>,
}

/// The opaque policy evaluator contract.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Run the evaluator against `request`, observing `cancel` at each
    /// region boundary.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::TimedOut`] if the wall-clock budget elapses, or
    /// [`ErrorKind::Internal`] on a crash or malformed output tree.
    async fn evaluate(&self, request: &EvaluationRequest, cancel: &CancellableJob) -> CoreResult<EvaluationOutcome>;
}

/// Canned evaluator for tests: returns pre-baked output without spawning a
/// process.
#[derive(Debug, Clone, Default)]
pub struct MockPolicyEvaluator {
    /// Output to hand back from every call.
    pub canned: EvaluationOutcome,
}

#[async_trait]
impl PolicyEvaluator for MockPolicyEvaluator {
    async fn evaluate(&self, _request: &EvaluationRequest, _cancel: &CancellableJob) -> CoreResult<EvaluationOutcome> {
        Ok(self.canned.clone())
    }
}

/// Evaluator that shells out to a real subprocess, one invocation per
/// region so cancellation can be observed at the region boundary.
pub struct ProcessPolicyEvaluator {
    /// Executable to invoke.
    pub command: String,
    /// Arguments prepended before the per-region flags.
    pub args: Vec<String>,
}

impl ProcessPolicyEvaluator {
    /// Construct an evaluator that shells out to `command`.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    async fn evaluate_region(&self, request: &EvaluationRequest, region: &str) -> CoreResult<Vec<RegionOutput>> {
        let region_dir = request.working_dir.join(region);
        tokio::fs::create_dir_all(&region_dir)
            .await
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("create region dir: {e}")))?;
        tokio::fs::write(region_dir.join("bundle.txt"), &request.bundle)
            .await
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("write bundle: {e}")))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--region")
            .arg(region)
            .arg("--output-dir")
            .arg(&region_dir)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &request.credential_env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("spawn evaluator: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_to_tracing(stdout, "stdout", region.to_string()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_to_tracing(stderr, "stderr", region.to_string()));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("wait for evaluator: {e}")))?;
        if !status.success() {
            write_crash_manifest(&region_dir, status.code()).await;
        }

        read_region_outputs(&region_dir, region).await
    }
}

async fn drain_to_tracing<R: tokio::io::AsyncRead + Unpin>(reader: R, stream: &'static str, region: String) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            tracing::debug!(target: "rcx.worker.evaluator", %region, stream, "{line}");
        }
    }
}

async fn write_crash_manifest(region_dir: &Path, exit_code: Option<i32>) {
    let manifest = serde_json::json!({
        "synthesized": true,
        "reason": "evaluator exited non-zero",
        "exit_code": exit_code,
    });
    let _ = tokio::fs::write(
        region_dir.join("errors.log"),
        serde_json::to_string_pretty(&manifest).unwrap_or_default(),
    )
    .await;
}

/// Enumerate the per-policy subdirectories of `region_dir` and parse each
/// into a [`RegionOutput`]. A job evaluating `N` policies against a region
/// writes `N` subdirectories, one per policy, each shaped like the flat
/// single-policy tree this evaluator used to read directly.
async fn read_region_outputs(region_dir: &Path, region: &str) -> CoreResult<Vec<RegionOutput>> {
    let mut outputs = Vec::new();
    let mut entries = tokio::fs::read_dir(region_dir)
        .await
        .map_err(|e| CoreError::new(ErrorKind::Internal, format!("read region dir: {e}")))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CoreError::new(ErrorKind::Internal, format!("read region dir entry: {e}")))?
    {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let policy_name = entry.file_name().to_string_lossy().into_owned();
        outputs.push(read_policy_output(&path, region, &policy_name).await?);
    }

    if outputs.is_empty() {
        // No per-policy subdirectory was ever written (e.g. the evaluator
        // crashed before producing one) — fall back to whatever landed
        // directly in the region directory, such as a synthesized crash
        // manifest.
        outputs.push(read_policy_output(region_dir, region, "unknown").await?);
    }

    Ok(outputs)
}

async fn read_policy_output(policy_dir: &Path, region: &str, policy_name: &str) -> CoreResult<RegionOutput> {
    let metadata_path = policy_dir.join("metadata.json");
    let metadata: RegionMetadata = match tokio::fs::read(&metadata_path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("parse metadata.json: {e}")))?,
        Err(_) => RegionMetadata {
            policy_name: policy_name.to_string(),
            policy_description: "evaluator produced no metadata.json".into(),
            resource_type: "unknown".into(),
            output_dir: policy_dir.display().to_string(),
        },
    };

    let resources: Vec<serde_json::Value> = match tokio::fs::read(policy_dir.join("resources.json")).await {
        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::new(ErrorKind::Internal, format!("parse resources.json: {e}")))?,
        _ => Vec::new(),
    };

    let errors_log = tokio::fs::read_to_string(policy_dir.join("errors.log")).await.ok();

    Ok(RegionOutput {
        region: region.to_string(),
        policy_name: policy_name.to_string(),
        metadata,
        resources,
        errors_log,
    })
}

#[async_trait]
impl PolicyEvaluator for ProcessPolicyEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest, cancel: &CancellableJob) -> CoreResult<EvaluationOutcome> {
        let run = async {
            let mut outcome = EvaluationOutcome::default();
            for region in &request.regions {
                if cancel.is_cancelled() {
                    tracing::info!(target: "rcx.worker.evaluator", %region, "cancellation observed at region boundary");
                    break;
                }
                let outputs = self.evaluate_region(request, region).await?;
                outcome.regions.extend(outputs);
            }
            Ok(outcome)
        };

        match tokio::time::timeout(request.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::new(ErrorKind::TimedOut, "policy evaluator exceeded its wall-clock budget")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_evaluator_returns_canned_output() {
        let evaluator = MockPolicyEvaluator {
            canned: EvaluationOutcome {
                regions: vec![RegionOutput {
                    region: "us-east-1".into(),
                    policy_name: "s3-public-read".into(),
                    metadata: RegionMetadata {
                        policy_name: "s3-public-read".into(),
                        policy_description: "flags public buckets".into(),
                        resource_type: "s3_bucket".into(),
                        output_dir: "/tmp".into(),
                    },
                    resources: vec![],
                    errors_log: None,
                }],
            },
        };
        let request = EvaluationRequest {
            bundle: vec![],
            credential_env: BTreeMap::new(),
            regions: vec!["us-east-1".into()],
            working_dir: PathBuf::from("/tmp"),
            timeout: Duration::from_secs(1),
        };
        let outcome = evaluator.evaluate(&request, &CancellableJob::new()).await.unwrap();
        assert_eq!(outcome.regions.len(), 1);
    }

    #[tokio::test]
    async fn process_evaluator_stops_at_cancelled_region_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ProcessPolicyEvaluator::new("true", vec![]);
        let cancel = CancellableJob::new();
        cancel.cancel(rcx_coordinator::cancel::CancellationReason::UserRequested);
        let request = EvaluationRequest {
            bundle: b"AWS:r1\n".to_vec(),
            credential_env: BTreeMap::new(),
            regions: vec!["us-east-1".into(), "eu-west-1".into()],
            working_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
        };
        let outcome = evaluator.evaluate(&request, &cancel).await.unwrap();
        assert!(outcome.regions.is_empty());
    }

    #[tokio::test]
    async fn process_evaluator_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = ProcessPolicyEvaluator::new("sleep", vec!["5".into()]);
        let request = EvaluationRequest {
            bundle: b"AWS:r1\n".to_vec(),
            credential_env: BTreeMap::new(),
            regions: vec!["us-east-1".into()],
            working_dir: dir.path().to_path_buf(),
            timeout: Duration::from_millis(50),
        };
        let err = evaluator.evaluate(&request, &CancellableJob::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimedOut);
    }
}
