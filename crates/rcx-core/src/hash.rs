// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialization and SHA-256 hashing.
//!
//! Used both for ruleset fingerprints (§4.5) and for any content-addressed
//! artifact key in the Blob Store.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors from canonicalization.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// JSON serialization failed.
    #[error("failed to serialize for hashing: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: object keys are
/// sorted (`serde_json::Map` is a `BTreeMap` under the `preserve_order`-off
/// default) and numbers serialize consistently.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, HashError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Ruleset fingerprint = `sha256(cloud, sorted rule-id list, filter predicate)`.
///
/// `filter_predicate` is the canonical-JSON form of whatever selector
/// produced `rule_ids` (explicit list, or standards+service filters) so two
/// semantically-identical compiles always land on the same fingerprint.
pub fn ruleset_fingerprint(
    cloud: &str,
    rule_ids: &[String],
    filter_predicate: &serde_json::Value,
) -> Result<String, HashError> {
    let mut sorted = rule_ids.to_vec();
    sorted.sort();
    let payload = serde_json::json!({
        "cloud": cloud,
        "rule_ids": sorted,
        "filter": filter_predicate,
    });
    let json = canonical_json(&payload)?;
    Ok(sha256_hex(json.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_order_independent() {
        let a = ruleset_fingerprint(
            "AWS",
            &["r2".into(), "r1".into()],
            &serde_json::json!({}),
        )
        .unwrap();
        let b = ruleset_fingerprint(
            "AWS",
            &["r1".into(), "r2".into()],
            &serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_filter() {
        let a = ruleset_fingerprint("AWS", &["r1".into()], &serde_json::json!({"x": 1})).unwrap();
        let b = ruleset_fingerprint("AWS", &["r1".into()], &serde_json::json!({"x": 2})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_hex_is_64_chars() {
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Generalizes `fingerprint_is_order_independent`: any permutation
        /// of the same rule id multiset, with the same cloud and filter,
        /// hashes to the same fingerprint.
        #[test]
        fn fingerprint_ignores_rule_id_order(
            mut ids in prop::collection::vec("[a-z]{2,6}", 0..12),
            filter_key in "[a-z]{1,4}",
        ) {
            let filter = serde_json::json!({ filter_key: 1 });
            let forward = ruleset_fingerprint("AWS", &ids, &filter).unwrap();
            ids.reverse();
            let reversed = ruleset_fingerprint("AWS", &ids, &filter).unwrap();
            prop_assert_eq!(forward, reversed);
        }

        /// Changing the cloud, any rule id, or the filter predicate must
        /// not collide with a different input's fingerprint (no proof of
        /// collision-freedom, just that trivial single-field perturbation
        /// always changes the digest for these small inputs).
        #[test]
        fn fingerprint_changes_when_cloud_differs(
            ids in prop::collection::vec("[a-z]{2,6}", 1..6),
        ) {
            let filter = serde_json::json!({});
            let aws = ruleset_fingerprint("AWS", &ids, &filter).unwrap();
            let azure = ruleset_fingerprint("Azure", &ids, &filter).unwrap();
            prop_assert_ne!(aws, azure);
        }
    }
}
