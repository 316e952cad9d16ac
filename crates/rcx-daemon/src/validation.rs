// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request validation for the daemon API.

use crate::api::SubmitJobRequest;
use rcx_ruleset::RuleSelector;

/// Maximum number of regions accepted in a single submission.
const MAX_REGIONS: usize = 64;

/// Maximum length for a submitter identity string.
const MAX_SUBMITTER_LENGTH: usize = 256;

/// Validates incoming API requests before they reach the coordinator,
/// accumulating every error found rather than stopping at the first.
pub struct RequestValidator;

impl RequestValidator {
    /// Validate all fields of a [`SubmitJobRequest`].
    pub fn validate_submit_job(req: &SubmitJobRequest) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if req.customer_id.trim().is_empty() {
            errors.push("customer_id must not be empty".into());
        }
        if req.tenant_name.trim().is_empty() {
            errors.push("tenant_name must not be empty".into());
        }
        if req.regions.is_empty() {
            errors.push("regions must not be empty".into());
        } else if req.regions.len() > MAX_REGIONS {
            errors.push(format!("regions exceeds maximum of {MAX_REGIONS}"));
        }
        if req.regions.iter().any(|r| r.trim().is_empty()) {
            errors.push("regions must not contain empty strings".into());
        }
        if let Err(e) = Self::validate_submitter(&req.submitter) {
            errors.push(e);
        }
        if let RuleSelector::Explicit(ids) = &req.selector {
            if ids.is_empty() {
                errors.push("selector.explicit must not be an empty rule id list".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate a submitter identity string.
    pub fn validate_submitter(submitter: &str) -> Result<(), String> {
        if submitter.trim().is_empty() {
            return Err("submitter must not be empty".into());
        }
        if submitter.len() > MAX_SUBMITTER_LENGTH {
            return Err(format!(
                "submitter exceeds maximum length of {MAX_SUBMITTER_LENGTH} characters"
            ));
        }
        Ok(())
    }

    /// Validate that `job_id` is a well-formed UUID string, as it arrives
    /// in a path parameter.
    pub fn validate_job_id(job_id: &str) -> Result<(), String> {
        if job_id.is_empty() {
            return Err("job_id must not be empty".into());
        }
        job_id
            .parse::<uuid::Uuid>()
            .map(|_| ())
            .map_err(|_| format!("invalid job id format: {job_id}"))
    }
}
