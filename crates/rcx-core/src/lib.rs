// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! rcx-core
//!
//! The stable data model for the rule engine's job orchestration substrate.
//! If you only take one dependency from this workspace, take this one.

/// Canonical JSON + SHA-256 hashing shared by receipts and ruleset fingerprints.
pub mod hash;
/// Typed primary-key newtypes resolved through the Record Store.
pub mod keys;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use keys::{JobId, LicenseKey, RuleSetId, TenantKey};

/// Current data-model contract version embedded in every persisted record.
pub const CONTRACT_VERSION: &str = "rcx/v1";

/// Cloud provider a [`Tenant`] or [`Rule`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CloudKind {
    Aws,
    Azure,
    Google,
    Kubernetes,
}

impl std::fmt::Display for CloudKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Aws => "AWS",
            Self::Azure => "AZURE",
            Self::Google => "GOOGLE",
            Self::Kubernetes => "KUBERNETES",
        };
        write!(f, "{s}")
    }
}

/// Severity of a [`Rule`] finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A customer-owned logical boundary over one cloud account or Kubernetes cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tenant {
    /// Owning customer.
    pub customer_id: String,
    /// Tenant name, unique within the customer.
    pub tenant_name: String,
    /// Cloud this tenant targets.
    pub cloud: CloudKind,
    /// Provider-native account/subscription/project identifier.
    pub native_account_id: String,
    /// Regions this tenant has activated for scanning.
    pub activated_regions: BTreeSet<String>,
    /// Rule ids explicitly excluded for this tenant.
    pub excluded_rules: BTreeSet<String>,
    /// Rule ids explicitly included (narrows selection when non-empty).
    pub included_rules: BTreeSet<String>,
    /// Display name shown in CLI/report output.
    pub display_name: String,
    /// Whether the tenant currently accepts new job submissions.
    pub is_active: bool,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Record last-update time.
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Returns the `(customer_id, tenant_name)` key this entity is identified by.
    #[must_use]
    pub fn key(&self) -> TenantKey {
        TenantKey::new(&self.customer_id, &self.tenant_name)
    }

    /// `Excluded ∩ Included = ∅` invariant from the data model.
    #[must_use]
    pub fn exclusion_inclusion_disjoint(&self) -> bool {
        self.excluded_rules.is_disjoint(&self.included_rules)
    }
}

/// A time-bounded grant of allowed rulesets and job quota.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct License {
    /// Unique license identifier.
    pub license_key: LicenseKey,
    /// The customer this license was issued to.
    pub customer_id: String,
    /// Ruleset names this license permits.
    pub allowed_rulesets: BTreeSet<String>,
    /// Maximum number of distinct rule ids covered.
    pub rule_quota: u32,
    /// Maximum concurrently-reserved jobs per billing period.
    pub job_quota_per_period: u32,
    /// License grant start.
    pub valid_from: DateTime<Utc>,
    /// License grant end; strictly increases across renewals.
    pub valid_until: DateTime<Utc>,
    /// Signature algorithm used for activation signing (e.g. `"ed25519"`).
    pub signing_algorithm: String,
    /// Key id for the signing keypair, whose private half lives in the Secret Broker.
    pub signing_key_id: String,
    /// Tenants this license has been activated against.
    pub activations: std::collections::BTreeMap<TenantKey, ActivationRecord>,
}

impl License {
    /// `valid_until < now` makes a license unusable.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}

/// A license-to-tenant binding authorizing scans.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActivationRecord {
    /// When the activation was granted.
    pub activated_at: DateTime<Utc>,
    /// Jobs currently holding a quota reservation against this activation.
    pub reserved_jobs: u32,
}

/// Reference to an external policy repository.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleSource {
    /// Unique identifier for this source.
    pub rule_source_id: String,
    /// Repository URL.
    pub url: String,
    /// Ref to fetch (branch, tag, or commit-ish).
    pub git_ref: String,
    /// Path prefix within the repository to walk.
    pub path_prefix: String,
    /// Sealed access secret reference (never the raw token).
    pub sealed_secret_ref: Option<String>,
    /// Owning customer.
    pub customer_id: String,
    /// Tenants explicitly allowed to use this source (empty = all of customer's).
    pub allow_tenants: BTreeSet<String>,
    /// Tenants explicitly denied, overriding `allow_tenants`.
    pub restrict_tenants: BTreeSet<String>,
    /// Commit hash observed at the last successful sync.
    pub last_commit_hash: Option<String>,
}

/// Logical identity `rule_id` (e.g. `ecc-aws-070-…`), immutable per `(rule_id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    /// Logical rule identifier.
    pub rule_id: String,
    /// Monotonic version within this rule id.
    pub version: u32,
    /// Cloud this rule evaluates against.
    pub cloud: CloudKind,
    /// Resource type the rule inspects (provider-native type string).
    pub resource_type: String,
    /// Severity of a violation.
    pub severity: Severity,
    /// Human-readable description.
    pub description: String,
    /// Service section (e.g. `"s3"`, `"iam"`).
    pub service: String,
    /// Mapped compliance standards and control ids, e.g. `"CIS_v1.4" -> ["1.1", "1.2"]`.
    pub standards: std::collections::BTreeMap<String, Vec<String>>,
    /// MITRE ATT&CK tactic → technique ids this rule detects.
    pub mitre: std::collections::BTreeMap<String, Vec<String>>,
    /// Set when a newer sync no longer found this rule; retained for explainability.
    pub tombstoned: bool,
    /// Source this rule was ingested from.
    pub rule_source_id: String,
}

/// Status of a [`RuleSet`]'s materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleSetStatus {
    Compiling,
    Ready,
    Failed,
}

/// A named, versioned bundle of rule ids for a cloud.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleSet {
    /// Unique identifier.
    pub id: RuleSetId,
    /// Human-assigned name (e.g. `"AWS_CIS_v1"`).
    pub name: String,
    /// Cloud this bundle targets.
    pub cloud: CloudKind,
    /// Rule ids in this bundle, in compiled (sorted) order.
    pub rule_ids: Vec<String>,
    /// Current materialization status.
    pub status: RuleSetStatus,
    /// Blob Store key of the materialized artifact, once `Ready`.
    pub artifact_key: Option<String>,
    /// Content hash / fingerprint of `(cloud, sorted rule-id list, filter predicate)`.
    pub fingerprint: String,
    /// License this bundle was scoped against, if any.
    pub license_key: Option<LicenseKey>,
    /// Number of non-terminal jobs currently referencing this bundle.
    pub reference_count: u32,
}

/// Terminal and non-terminal states of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Reserved,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobState {
    /// Terminal states hold no [`crate::TenantKey`] slot.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// States that legitimately hold a `TenantSlot`.
    #[must_use]
    pub fn holds_slot(&self) -> bool {
        matches!(self, Self::Reserved | Self::Ready | Self::Running)
    }
}

/// A single unit of scan work.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Tenant this job scans.
    pub tenant: TenantKey,
    /// Cloud being scanned (must match the tenant's cloud).
    pub cloud: CloudKind,
    /// Regions in scope, a subset of the tenant's activated regions.
    pub regions: Vec<String>,
    /// RuleSets consulted for this job.
    pub ruleset_ids: Vec<RuleSetId>,
    /// License covering this job's quota reservation.
    pub license_key: LicenseKey,
    /// Caller identity that submitted the job.
    pub submitter: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Error classification, set only in terminal failure states.
    pub error_kind: Option<String>,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Start time, set on transition to `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// End time, set on any terminal transition.
    pub ended_at: Option<DateTime<Utc>>,
    /// Blob key of the raw result artifact tree.
    pub result_artifact_key: Option<String>,
    /// Blob key of the canonical statistics document.
    pub statistics_artifact_key: Option<String>,
    /// Sealed reference to the credentials resolved for this job at
    /// admission, unsealed by the worker runtime just before invoking the
    /// policy evaluator.
    pub credential_ref: Option<rcx_secrets::SecretRef>,
    /// Number of admission attempts (retries after transient failure).
    pub attempt: u32,
    /// Set by an explicit terminate request; observed cooperatively by the worker.
    pub cancel_requested: bool,
    /// Trace id threaded through every log line and error surfaced for this job.
    pub trace_id: uuid::Uuid,
}

/// A named, schedule-driven template that yields a fresh [`Job`] on each fire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduledJob {
    /// Unique name within the owning customer.
    pub name: String,
    /// Owning customer.
    pub customer_id: String,
    /// `cron(...)` or `rate(...)` schedule expression.
    pub schedule_expr: String,
    /// Whether this entry currently fires.
    pub enabled: bool,
    /// Tenant each fire submits a job against.
    pub target_tenant: TenantKey,
    /// Regions each fire scopes.
    pub regions: Vec<String>,
    /// Rulesets each fire consults.
    pub ruleset_ids: Vec<RuleSetId>,
    /// Last successful fire time, used for CAS-guarded de-duplication.
    pub last_fire_time: Option<DateTime<Utc>>,
}

/// A coalesced bundle of resource-change events for a tenant within a window.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchResult {
    /// Tenant these events belong to.
    pub tenant: TenantKey,
    /// Inclusive start of the coalescing window.
    pub window_start: DateTime<Utc>,
    /// Exclusive end of the coalescing window.
    pub window_end: DateTime<Utc>,
    /// Jobs this batch fed into.
    pub referencing_jobs: Vec<JobId>,
    /// Number of distinct resource-change events coalesced.
    pub event_count: u32,
}

/// Point-in-time per-tenant aggregation of findings, usable for reports.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricSnapshot {
    /// Schema tag so older snapshots remain decodable as the shape evolves.
    pub version: u32,
    /// Tenant this snapshot summarizes.
    pub tenant: TenantKey,
    /// Snapshot date (aggregation is keyed per-day).
    pub as_of: DateTime<Utc>,
    /// Resource-type → count of findings.
    pub by_resource_type: std::collections::BTreeMap<String, u64>,
    /// Severity → count of findings.
    pub by_severity: std::collections::BTreeMap<String, u64>,
    /// MITRE tactic → technique → resource identities.
    pub mitre_map: std::collections::BTreeMap<String, std::collections::BTreeMap<String, Vec<String>>>,
    /// Standard name → (covered_controls / total_controls) ratio.
    pub compliance_ratios: std::collections::BTreeMap<String, f64>,
    /// Date of the most recent contributing scan.
    pub last_scan_date: Option<DateTime<Utc>>,
    /// Regions represented in this snapshot.
    pub region_coverage: BTreeSet<String>,
    /// Highest-severity-first sample of finding resources.
    pub top_findings: Vec<String>,
}

/// Status of an ingested [`Finding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Passed,
    Failed,
    Error,
}

/// Classification of a per-rule ingestion error, in priority order
/// (highest first): `Credentials > Access > Quota > Throttling > Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestErrorKind {
    /// Lower numeric value = higher priority (see `Ord` derive + declaration order).
    Credentials,
    Access,
    Quota,
    Throttling,
    Internal,
}

/// `(arn-or-native-id, name, type, location)` identity of a scanned resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ResourceIdentity {
    /// Provider-native id or ARN.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Provider-native resource type.
    pub resource_type: String,
    /// Region/location.
    pub location: String,
}

/// A single `(rule_id, resource, region)` outcome.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    /// Rule that produced this outcome.
    pub rule_id: String,
    /// Region scanned.
    pub region: String,
    /// Resource identity, absent for rule-level (not resource-level) errors.
    pub resource: Option<ResourceIdentity>,
    /// RFC 3339 UTC timestamp.
    pub timestamp: DateTime<Utc>,
    /// Outcome status.
    pub status: FindingStatus,
    /// Error classification, set only when `status == Error`.
    pub error_kind: Option<IngestErrorKind>,
    /// Human-readable error message, set only when `status == Error`.
    pub error_message: Option<String>,
}

/// Excludes matching findings from reports only, never from raw statistics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum ResourceException {
    /// Matches by explicit resource identity.
    ByIdentity {
        tenant: TenantKey,
        resource_type: String,
        location: String,
        resource_id: String,
        expire_at: DateTime<Utc>,
    },
    /// Matches by ARN.
    ByArn {
        tenant: TenantKey,
        arn: String,
        expire_at: DateTime<Utc>,
    },
    /// Matches by a conjunction of tag key=value pairs.
    ByTagFilter {
        tenant: TenantKey,
        tags: std::collections::BTreeMap<String, String>,
        expire_at: DateTime<Utc>,
    },
}

impl ResourceException {
    /// The expiry shared by every exception form.
    #[must_use]
    pub fn expire_at(&self) -> DateTime<Utc> {
        match self {
            Self::ByIdentity { expire_at, .. }
            | Self::ByArn { expire_at, .. }
            | Self::ByTagFilter { expire_at, .. } => *expire_at,
        }
    }

    /// Whether this exception matches the given finding's resource.
    #[must_use]
    pub fn matches(&self, resource: &ResourceIdentity, tags: &std::collections::BTreeMap<String, String>) -> bool {
        match self {
            Self::ByIdentity {
                resource_type,
                location,
                resource_id,
                ..
            } => {
                &resource.resource_type == resource_type
                    && &resource.location == location
                    && &resource.id == resource_id
            }
            Self::ByArn { arn, .. } => &resource.id == arn,
            Self::ByTagFilter { tags: required, .. } => {
                required.iter().all(|(k, v)| tags.get(k) == Some(v))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminal_classification() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Running.holds_slot());
        assert!(!JobState::Succeeded.holds_slot());
    }

    #[test]
    fn ingest_error_priority_ordering() {
        let mut kinds = vec![
            IngestErrorKind::Internal,
            IngestErrorKind::Credentials,
            IngestErrorKind::Throttling,
        ];
        kinds.sort();
        assert_eq!(kinds[0], IngestErrorKind::Credentials);
        assert_eq!(kinds[2], IngestErrorKind::Internal);
    }

    #[test]
    fn tenant_rejects_overlapping_include_exclude() {
        let mut t = sample_tenant();
        t.included_rules.insert("r1".into());
        t.excluded_rules.insert("r1".into());
        assert!(!t.exclusion_inclusion_disjoint());
    }

    #[test]
    fn license_expiry_check() {
        let now = Utc::now();
        let mut lic = sample_license();
        lic.valid_until = now - chrono::Duration::days(1);
        assert!(lic.is_expired(now));
        lic.valid_until = now + chrono::Duration::days(1);
        assert!(!lic.is_expired(now));
    }

    fn sample_tenant() -> Tenant {
        Tenant {
            customer_id: "acme".into(),
            tenant_name: "prod".into(),
            cloud: CloudKind::Aws,
            native_account_id: "123456789012".into(),
            activated_regions: BTreeSet::from(["eu-west-1".into()]),
            excluded_rules: BTreeSet::new(),
            included_rules: BTreeSet::new(),
            display_name: "Acme Prod".into(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_license() -> License {
        License {
            license_key: LicenseKey::new("lic-1"),
            customer_id: "acme".into(),
            allowed_rulesets: BTreeSet::new(),
            rule_quota: 100,
            job_quota_per_period: 10,
            valid_from: Utc::now() - chrono::Duration::days(30),
            valid_until: Utc::now() + chrono::Duration::days(30),
            signing_algorithm: "ed25519".into(),
            signing_key_id: "key-1".into(),
            activations: std::collections::BTreeMap::new(),
        }
    }
}
