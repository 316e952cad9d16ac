// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed primary-key newtypes.
//!
//! Cross-entity references (Job ↔ RuleSet ↔ License ↔ Tenant) are stored as
//! these keys and resolved through the Record Store — never as pointer
//! cycles serialized directly into a record.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(customer_id, tenant_name)` composite key identifying a [`crate::Tenant`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TenantKey {
    /// Owning customer id.
    pub customer_id: String,
    /// Tenant name, unique within the customer.
    pub tenant_name: String,
}

impl TenantKey {
    /// Construct a key from its two components.
    #[must_use]
    pub fn new(customer_id: impl Into<String>, tenant_name: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            tenant_name: tenant_name.into(),
        }
    }

    /// Record Store prefix-scan key: `(customer, tenant)`.
    #[must_use]
    pub fn scan_prefix(&self) -> String {
        format!("{}/{}", self.customer_id, self.tenant_name)
    }
}

impl std::fmt::Display for TenantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.customer_id, self.tenant_name)
    }
}

/// Unique [`crate::Job`] identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Mint a fresh random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique [`crate::License`] identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct LicenseKey(pub String);

impl LicenseKey {
    /// Construct from a raw license key string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for LicenseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique [`crate::RuleSet`] identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct RuleSetId(pub Uuid);

impl RuleSetId {
    /// Mint a fresh random ruleset id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
