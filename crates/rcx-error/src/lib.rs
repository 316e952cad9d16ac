// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Error taxonomy shared across the job orchestration substrate.
//!
//! Every boundary that surfaces a failure — admission, ruleset compilation,
//! worker execution, ingestion, report dispatch — classifies it into one of
//! the [`ErrorKind`]s here before it crosses a component boundary.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of a failure, stable across every component boundary.
///
/// This is a taxonomy, not a catalog of identifiers: callers match on it to
/// decide retry/refund/surface behavior, they do not parse it for detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself is malformed.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// An optimistic write lost a race, or a uniqueness constraint was violated.
    Conflict,
    /// The tenant's concurrency slot is already held.
    Busy,
    /// The caller lacks permission for this operation.
    Forbidden,
    /// The license's `valid_until` has passed.
    LicenseExpired,
    /// The license's job quota for the current period is exhausted.
    LicenseQuota,
    /// Rule selection + exclusion + license intersection produced an empty set.
    NoRules,
    /// Credential resolution exhausted every precedence tier.
    NoCredentials,
    /// An external collaborator (License Manager, Secret Broker, Blob Store) is unreachable.
    UpstreamUnavailable,
    /// A bounded operation exceeded its timeout.
    TimedOut,
    /// An unclassified internal failure.
    Internal,
}

impl ErrorKind {
    /// Short machine-readable token, stable for logs and wire payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Busy => "BUSY",
            Self::Forbidden => "FORBIDDEN",
            Self::LicenseExpired => "LICENSE_EXPIRED",
            Self::LicenseQuota => "LICENSE_QUOTA",
            Self::NoRules => "NO_RULES",
            Self::NoCredentials => "NO_CREDENTIALS",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::TimedOut => "TIMED_OUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified error carrying a message, structured context, and the
/// `trace_id` of the job or request it originated from.
///
/// Context values must never contain secret material — see [`CoreError::redacted_context`].
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct CoreError {
    /// The error taxonomy classification.
    pub kind: ErrorKind,
    /// Human-readable message, safe to surface to the caller.
    pub message: String,
    /// Deterministically ordered key-value context (e.g. `tenant`, `job_id`).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Trace id of the originating job/request, echoed back to CLI callers.
    #[serde(default)]
    pub trace_id: Option<Uuid>,
}

impl CoreError {
    /// Start building a [`CoreError`] of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
            trace_id: None,
        }
    }

    /// Attach a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the trace id of the originating job/request.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Convenience constructor for [`ErrorKind::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Convenience constructor for [`ErrorKind::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Convenience constructor for [`ErrorKind::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Convenience result type used across the substrate's component crates.
pub type CoreResult<T> = Result<T, CoreError>;

/// The structured body returned to CLI/HTTP callers on failure.
///
/// Mirrors §7 of the design: `trace_id` plus an `errors` array, never
/// containing secret material.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    /// Trace id of the request that failed.
    pub trace_id: Uuid,
    /// One or more classified errors.
    pub errors: Vec<ErrorEntry>,
}

/// A single entry in an [`ErrorResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorEntry {
    /// Error taxonomy classification.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<CoreError> for ErrorResponse {
    fn from(err: CoreError) -> Self {
        let trace_id = err.trace_id.unwrap_or_else(Uuid::nil);
        ErrorResponse {
            trace_id,
            errors: vec![ErrorEntry {
                kind: err.kind.as_str().to_string(),
                message: err.message,
                hint: None,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = CoreError::new(ErrorKind::Busy, "tenant slot held");
        assert_eq!(e.to_string(), "[BUSY] tenant slot held");
    }

    #[test]
    fn context_is_deterministically_ordered() {
        let e = CoreError::internal("boom")
            .with_context("z", "1")
            .with_context("a", "2");
        let keys: Vec<_> = e.context.keys().collect();
        assert_eq!(keys, vec!["a", "z"]);
    }

    #[test]
    fn error_response_defaults_nil_trace_id() {
        let resp: ErrorResponse = CoreError::validation("bad input").into();
        assert_eq!(resp.trace_id, Uuid::nil());
        assert_eq!(resp.errors.len(), 1);
        assert_eq!(resp.errors[0].kind, "VALIDATION");
    }

    #[test]
    fn all_kinds_have_stable_tokens() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Busy,
            ErrorKind::Forbidden,
            ErrorKind::LicenseExpired,
            ErrorKind::LicenseQuota,
            ErrorKind::NoRules,
            ErrorKind::NoCredentials,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::TimedOut,
            ErrorKind::Internal,
        ];
        for k in kinds {
            assert!(!k.as_str().is_empty());
        }
    }
}
