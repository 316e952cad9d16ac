// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane API types.
//!
//! Request/response envelopes for the daemon's REST surface. The wire
//! format itself is a thin, versioned shell (see [`crate::versioning`])
//! around the domain records in `rcx_core`.

use chrono::{DateTime, Utc};
use rcx_core::{CloudKind, Job, JobId, TenantKey};
use rcx_error::ErrorResponse;
use rcx_ruleset::RuleSelector;
use serde::{Deserialize, Serialize};

/// `POST /jobs` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    /// Customer id owning the target tenant.
    pub customer_id: String,
    /// Tenant name within that customer.
    pub tenant_name: String,
    /// Cloud to scan.
    pub cloud: CloudKind,
    /// Regions to scope the scan to.
    pub regions: Vec<String>,
    /// How to select which rules to run.
    pub selector: RuleSelector,
    /// Principal submitting the job, echoed back for audit.
    pub submitter: String,
}

impl SubmitJobRequest {
    /// The tenant key this request targets.
    #[must_use]
    pub fn tenant(&self) -> TenantKey {
        TenantKey::new(self.customer_id.clone(), self.tenant_name.clone())
    }
}

/// `GET /jobs/{id}` and `POST /jobs` response.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    /// The job record.
    pub job: Job,
}

/// `GET /jobs` response.
#[derive(Debug, Clone, Serialize)]
pub struct JobListView {
    /// Jobs matching the query, most recently submitted first.
    pub jobs: Vec<Job>,
}

/// `POST /jobs/{id}/cancel` response.
#[derive(Debug, Clone, Serialize)]
pub struct JobCancelledView {
    /// The job that was cancelled.
    pub job_id: JobId,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` once the daemon can reach its record store.
    pub status: &'static str,
    /// Process build/schema version, for client compatibility checks.
    pub version: &'static str,
    /// When this health snapshot was produced.
    pub checked_at: DateTime<Utc>,
}

/// Every failure response shares the taxonomy-driven [`ErrorResponse`] shape.
pub type ApiError = ErrorResponse;
