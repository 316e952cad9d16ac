// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Credential Resolver: a small chain-of-responsibility over explicit,
//! tenant-bound, and submitter-environment credential sources.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcx_core::TenantKey;
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_secrets::{SecretBroker, SecretRef};

const MAX_TTL_SECS: i64 = 2 * 3600;

/// Raw, unsealed credential material. Never stored; sealed into a
/// [`SecretBroker`] immediately after resolution.
#[derive(Debug, Clone)]
pub struct RawCredentials {
    /// Serialized credential payload (access key pair, assume-role token,
    /// or whatever the cloud's SDK needs) — opaque to this crate.
    pub plaintext: String,
    /// Cloud-provider session duration, if the source knows one.
    pub role_session_duration: Option<ChronoDuration>,
}

/// A sealed, time-bound credential handle. Contains no plaintext.
#[derive(Debug, Clone)]
pub struct CredentialEnvelope {
    /// Opaque reference to the sealed credential material.
    pub secret_ref: SecretRef,
    /// Expiry, computed as `min(role_session_duration, 2h)` from resolution time.
    pub expires_at: DateTime<Utc>,
    /// Which link in the chain produced this envelope.
    pub source: CredentialSourceKind,
}

/// Which precedence tier resolved a [`CredentialEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSourceKind {
    /// Explicit credentials injected in the submission record.
    Explicit,
    /// A credentials binding previously registered for the tenant.
    TenantBinding,
    /// The submitter's own environment, if policy permits it.
    SubmitterEnvironment,
}

/// Everything a credential source needs to decide whether it applies.
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    /// Tenant the job is scanning on behalf of.
    pub tenant: TenantKey,
    /// Explicit credentials attached to the submission, if any.
    pub explicit: Option<RawCredentials>,
    /// The tenant's registered credentials binding, if any.
    pub tenant_binding: Option<RawCredentials>,
    /// The submitter's environment credentials, if policy allows falling
    /// back to them.
    pub submitter_environment: Option<RawCredentials>,
}

/// One link in the credential resolution chain.
///
/// Returns `None` to defer to the next link, or `Some(Err(_))` to abort the
/// chain outright (a link that applies but fails should not silently fall
/// through to a weaker source).
pub trait CredentialSource: Send + Sync {
    /// Attempt to resolve credentials for `request`.
    fn try_resolve(&self, request: &CredentialRequest, broker: &dyn SecretBroker) -> Option<CoreResult<CredentialEnvelope>>;
}

fn seal_with_ttl(
    broker: &dyn SecretBroker,
    raw: &RawCredentials,
    source: CredentialSourceKind,
) -> CoreResult<CredentialEnvelope> {
    let ttl = raw
        .role_session_duration
        .map(|d| d.num_seconds().min(MAX_TTL_SECS))
        .unwrap_or(MAX_TTL_SECS);
    let secret_ref = broker.seal(&raw.plaintext)?;
    Ok(CredentialEnvelope {
        secret_ref,
        expires_at: Utc::now() + ChronoDuration::seconds(ttl),
        source,
    })
}

/// Explicit credentials injected directly in the submission record.
/// Highest precedence.
#[derive(Debug, Default)]
pub struct ExplicitCredentialSource;

impl CredentialSource for ExplicitCredentialSource {
    fn try_resolve(&self, request: &CredentialRequest, broker: &dyn SecretBroker) -> Option<CoreResult<CredentialEnvelope>> {
        let raw = request.explicit.as_ref()?;
        Some(seal_with_ttl(broker, raw, CredentialSourceKind::Explicit))
    }
}

/// A credentials binding previously registered for the tenant (assume-role
/// ARN or static keypair).
#[derive(Debug, Default)]
pub struct TenantBindingCredentialSource;

impl CredentialSource for TenantBindingCredentialSource {
    fn try_resolve(&self, request: &CredentialRequest, broker: &dyn SecretBroker) -> Option<CoreResult<CredentialEnvelope>> {
        let raw = request.tenant_binding.as_ref()?;
        Some(seal_with_ttl(broker, raw, CredentialSourceKind::TenantBinding))
    }
}

/// The submitter's own environment, used only if policy permits it. Lowest
/// precedence.
#[derive(Debug, Default)]
pub struct SubmitterEnvironmentCredentialSource;

impl CredentialSource for SubmitterEnvironmentCredentialSource {
    fn try_resolve(&self, request: &CredentialRequest, broker: &dyn SecretBroker) -> Option<CoreResult<CredentialEnvelope>> {
        let raw = request.submitter_environment.as_ref()?;
        Some(seal_with_ttl(broker, raw, CredentialSourceKind::SubmitterEnvironment))
    }
}

/// Default precedence chain: explicit, then tenant binding, then submitter
/// environment.
#[must_use]
pub fn default_chain() -> Vec<Box<dyn CredentialSource>> {
    vec![
        Box::new(ExplicitCredentialSource),
        Box::new(TenantBindingCredentialSource),
        Box::new(SubmitterEnvironmentCredentialSource),
    ]
}

/// Walk `chain` in order, sealing the first applicable credential source.
///
/// # Errors
///
/// Returns whatever error the first applicable link produces, or
/// [`ErrorKind::NoCredentials`] if every link defers.
pub fn resolve_credentials(
    chain: &[Box<dyn CredentialSource>],
    request: &CredentialRequest,
    broker: &dyn SecretBroker,
) -> CoreResult<CredentialEnvelope> {
    for link in chain {
        if let Some(result) = link.try_resolve(request, broker) {
            return result;
        }
    }
    Err(CoreError::new(
        ErrorKind::NoCredentials,
        format!("no credential source resolved for tenant {}", request.tenant),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_secrets::InProcessSecretBroker;

    fn request(explicit: bool, tenant_binding: bool, submitter_env: bool) -> CredentialRequest {
        let raw = |tag: &str| RawCredentials {
            plaintext: tag.to_string(),
            role_session_duration: None,
        };
        CredentialRequest {
            tenant: TenantKey::new("cust-1", "t1"),
            explicit: explicit.then(|| raw("explicit")),
            tenant_binding: tenant_binding.then(|| raw("binding")),
            submitter_environment: submitter_env.then(|| raw("env")),
        }
    }

    #[test]
    fn explicit_wins_over_everything() {
        let broker = InProcessSecretBroker::new();
        let chain = default_chain();
        let req = request(true, true, true);
        let env = resolve_credentials(&chain, &req, &broker).unwrap();
        assert_eq!(env.source, CredentialSourceKind::Explicit);
        assert_eq!(broker.unseal(&env.secret_ref).unwrap(), "explicit");
    }

    #[test]
    fn falls_through_to_tenant_binding() {
        let broker = InProcessSecretBroker::new();
        let chain = default_chain();
        let req = request(false, true, true);
        let env = resolve_credentials(&chain, &req, &broker).unwrap();
        assert_eq!(env.source, CredentialSourceKind::TenantBinding);
    }

    #[test]
    fn falls_through_to_submitter_environment() {
        let broker = InProcessSecretBroker::new();
        let chain = default_chain();
        let req = request(false, false, true);
        let env = resolve_credentials(&chain, &req, &broker).unwrap();
        assert_eq!(env.source, CredentialSourceKind::SubmitterEnvironment);
    }

    #[test]
    fn exhaustion_is_no_credentials() {
        let broker = InProcessSecretBroker::new();
        let chain = default_chain();
        let req = request(false, false, false);
        let err = resolve_credentials(&chain, &req, &broker).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoCredentials);
    }

    #[test]
    fn ttl_is_capped_at_two_hours() {
        let broker = InProcessSecretBroker::new();
        let mut req = request(true, false, false);
        req.explicit.as_mut().unwrap().role_session_duration = Some(ChronoDuration::hours(12));
        let chain = default_chain();
        let env = resolve_credentials(&chain, &req, &broker).unwrap();
        let ttl = env.expires_at - Utc::now();
        assert!(ttl.num_seconds() <= MAX_TTL_SECS);
    }
}
