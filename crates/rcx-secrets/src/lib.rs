// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Secret Broker: opaque references to sealed credentials.
//!
//! Nothing outside this crate ever holds a plaintext secret longer than the
//! single call that needs it. A [`SecretRef`] is safe to log, store in a
//! record, or pass across a trait boundary; its `Debug`/`Display` never
//! print the underlying value.

use rcx_error::{CoreError, CoreResult, ErrorKind};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use uuid::Uuid;

/// An opaque handle to a sealed secret. Carries no plaintext.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SecretRef(String);

impl SecretRef {
    fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretRef(<redacted:{}>)", &self.0[..8])
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<redacted:{}>", &self.0[..8])
    }
}

/// Seal, unseal, rotate, and forget secrets without ever persisting
/// plaintext in a [`rcx_store::RecordStore`] record.
pub trait SecretBroker: Send + Sync {
    /// Seal `plaintext`, returning an opaque reference to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing secret engine cannot be written to.
    fn seal(&self, plaintext: &str) -> CoreResult<SecretRef>;

    /// Resolve a reference back to its plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the reference is unknown or has
    /// been forgotten.
    fn unseal(&self, secret_ref: &SecretRef) -> CoreResult<String>;

    /// Replace the plaintext behind an existing reference, keeping the same
    /// opaque handle so dependents do not need to be updated.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NotFound`] if the reference is unknown.
    fn rotate(&self, secret_ref: &SecretRef, new_plaintext: &str) -> CoreResult<()>;

    /// Permanently discard a sealed secret. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing secret engine cannot be written to.
    fn forget(&self, secret_ref: &SecretRef) -> CoreResult<()>;
}

/// In-process [`SecretBroker`] backed by a locked map, standing in for a
/// Vault-backed deployment in tests and single-node setups.
#[derive(Debug, Default)]
pub struct InProcessSecretBroker {
    sealed: Mutex<BTreeMap<String, String>>,
}

impl InProcessSecretBroker {
    /// Construct an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBroker for InProcessSecretBroker {
    fn seal(&self, plaintext: &str) -> CoreResult<SecretRef> {
        let secret_ref = SecretRef::new();
        let mut sealed = self.sealed.lock().expect("secret broker lock poisoned");
        sealed.insert(secret_ref.0.clone(), plaintext.to_string());
        Ok(secret_ref)
    }

    fn unseal(&self, secret_ref: &SecretRef) -> CoreResult<String> {
        let sealed = self.sealed.lock().expect("secret broker lock poisoned");
        sealed.get(&secret_ref.0).cloned().ok_or_else(|| {
            CoreError::new(ErrorKind::NotFound, format!("unknown secret ref {secret_ref}"))
        })
    }

    fn rotate(&self, secret_ref: &SecretRef, new_plaintext: &str) -> CoreResult<()> {
        let mut sealed = self.sealed.lock().expect("secret broker lock poisoned");
        let slot = sealed.get_mut(&secret_ref.0).ok_or_else(|| {
            CoreError::new(ErrorKind::NotFound, format!("unknown secret ref {secret_ref}"))
        })?;
        *slot = new_plaintext.to_string();
        Ok(())
    }

    fn forget(&self, secret_ref: &SecretRef) -> CoreResult<()> {
        let mut sealed = self.sealed.lock().expect("secret broker lock poisoned");
        sealed.remove(&secret_ref.0);
        Ok(())
    }
}
