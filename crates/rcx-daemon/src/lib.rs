// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! HTTP control plane for the job orchestration substrate.
//!
//! Thin request/response shell around [`rcx_coordinator::admit`] and the
//! record stores: every handler here validates, builds a
//! [`rcx_coordinator::Submission`] or looks up a [`rcx_core::Job`], and
//! defers all business logic to the crates beneath it.

pub mod api;
pub mod middleware;
pub mod pipeline;
pub mod scheduler;
pub mod state;
pub mod validation;

use api::{HealthResponse, JobCancelledView, JobListView, JobView, SubmitJobRequest};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rcx_core::JobId;
use rcx_coordinator::{force_cancel, Submission};
use rcx_error::{CoreError, ErrorKind, ErrorResponse};
use state::AppState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use validation::RequestValidator;

/// Wraps a [`CoreError`] so it can be returned directly from a handler.
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        let body: ErrorResponse = self.0.into();
        (status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Busy => StatusCode::CONFLICT,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::LicenseExpired | ErrorKind::LicenseQuota => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::NoRules | ErrorKind::NoCredentials => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn validation_error(errors: Vec<String>) -> ApiError {
    ApiError(CoreError::validation(errors.join("; ")))
}

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    RequestValidator::validate_submit_job(&req).map_err(validation_error)?;

    let submission = Submission {
        tenant: req.tenant(),
        cloud: req.cloud,
        regions: req.regions.clone(),
        selector: req.selector.clone(),
        submitter: req.submitter.clone(),
        explicit_credentials: None,
        tenant_binding_credentials: None,
        submitter_environment_credentials: None,
    };

    let job = state.with_admission(|ctx| rcx_coordinator::admit(ctx, submission))?;
    Ok((StatusCode::CREATED, Json(JobView { job })))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    RequestValidator::validate_job_id(&job_id).map_err(|e| validation_error(vec![e]))?;
    let id: uuid::Uuid = job_id
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid job id: {job_id}")))?;
    let job = state.require_job(JobId(id))?;
    Ok(Json(JobView { job }))
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<JobListView>, ApiError> {
    let customer_id = params
        .get("customer_id")
        .cloned()
        .ok_or_else(|| CoreError::validation("customer_id query parameter is required"))?;
    let tenant_name = params
        .get("tenant_name")
        .cloned()
        .ok_or_else(|| CoreError::validation("tenant_name query parameter is required"))?;
    let tenant = rcx_core::TenantKey::new(customer_id, tenant_name);
    let jobs = state.jobs_for_tenant(&tenant)?;
    Ok(Json(JobListView { jobs }))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobCancelledView>, ApiError> {
    RequestValidator::validate_job_id(&job_id).map_err(|e| validation_error(vec![e]))?;
    let id: uuid::Uuid = job_id
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid job id: {job_id}")))?;
    let job_id = JobId(id);
    let slots = state.slot_store();
    force_cancel(state.jobs.as_ref(), &slots, job_id)?;
    Ok(Json(JobCancelledView { job_id }))
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    RequestValidator::validate_job_id(&job_id).map_err(|e| validation_error(vec![e]))?;
    let id: uuid::Uuid = job_id
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid job id: {job_id}")))?;
    let job = pipeline::run_job(&state, JobId(id)).await?;
    Ok(Json(JobView { job }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        checked_at: Utc::now(),
    })
}

/// Assemble the daemon's router: request-id tagging, structured logging,
/// and rate limiting wrap every route.
#[must_use]
pub fn router(state: Arc<AppState>, rate_limit_per_minute: u32) -> Router {
    let limiter = middleware::RateLimiter::new(rate_limit_per_minute, Duration::from_secs(60));

    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/jobs/{job_id}/run", post(run_job))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .with_state(state)
}

async fn rate_limit_middleware(
    State(limiter): State<middleware::RateLimiter>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if !limiter.allow().await {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rcx_core::{CloudKind, License, LicenseKey, Tenant};
    use rcx_secrets::InProcessSecretBroker;
    use std::collections::BTreeMap as Map;
    use std::collections::BTreeSet;
    use tower::ServiceExt;

    fn harness() -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let secrets: Box<dyn rcx_secrets::SecretBroker> = Box::new(InProcessSecretBroker::new());
        let identity_key_ref = secrets.seal("test-signing-key").unwrap();
        let license = License {
            license_key: LicenseKey::new("lic-1"),
            customer_id: "cust-1".into(),
            allowed_rulesets: BTreeSet::new(),
            rule_quota: 1000,
            job_quota_per_period: 10,
            valid_from: Utc::now() - chrono::Duration::days(1),
            valid_until: Utc::now() + chrono::Duration::days(30),
            signing_algorithm: "sha256-keyed".into(),
            signing_key_id: "key-1".into(),
            activations: Map::new(),
        };
        let state =
            AppState::open_fs(dir.path(), license, secrets, identity_key_ref, false, "true".into(), 60).unwrap();
        let tenant = Tenant {
            customer_id: "cust-1".into(),
            tenant_name: "prod".into(),
            cloud: CloudKind::Aws,
            native_account_id: "111111111111".into(),
            activated_regions: BTreeSet::from(["us-east-1".to_string()]),
            excluded_rules: BTreeSet::new(),
            included_rules: BTreeSet::new(),
            display_name: "Prod".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let tenant_key = rcx_core::TenantKey::new(tenant.customer_id.clone(), tenant.tenant_name.clone());
        state.tenants.put(&tenant_key.scan_prefix(), tenant, None).unwrap();
        (Arc::new(state), dir)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _dir) = harness();
        let app = router(state, 1000);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_job_with_no_rules_available_returns_unprocessable() {
        let (state, _dir) = harness();
        let app = router(state, 1000);
        let body = serde_json::json!({
            "customer_id": "cust-1",
            "tenant_name": "prod",
            "cloud": "aws",
            "regions": ["us-east-1"],
            "selector": {"form": "explicit", "value": ["r1"]},
            "submitter": "alice"
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn submit_job_with_blank_tenant_name_rejected_before_admission() {
        let (state, _dir) = harness();
        let app = router(state, 1000);
        let body = serde_json::json!({
            "customer_id": "cust-1",
            "tenant_name": "",
            "cloud": "aws",
            "regions": ["us-east-1"],
            "selector": {"form": "explicit", "value": ["r1"]},
            "submitter": "alice"
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_unknown_job_returns_not_found() {
        let (state, _dir) = harness();
        let app = router(state, 1000);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.errors[0].kind, "NOT_FOUND");
    }

    #[tokio::test]
    async fn malformed_job_id_rejected_as_bad_request() {
        let (state, _dir) = harness();
        let app = router(state, 1000);
        let resp = app
            .oneshot(Request::builder().uri("/jobs/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
