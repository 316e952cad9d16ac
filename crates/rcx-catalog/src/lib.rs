// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Rule Catalog: sync from configured rule sources, queryable by cloud,
//! standard, severity, service, and resource type with opaque pagination.

use base64::Engine;
use rcx_core::{CloudKind, Rule, RuleSource, Severity};
use rcx_error::{CoreError, CoreResult, ErrorKind};
use rcx_store::RecordStore;
use serde::{Deserialize, Serialize};

/// One rule fetched from a source, prior to being recorded in the catalog.
#[derive(Debug, Clone)]
pub struct FetchedRule {
    /// The parsed rule.
    pub rule: Rule,
}

/// Result of fetching a rule source at its configured ref.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Commit hash the fetch resolved to.
    pub commit_hash: String,
    /// Rules parsed from files under the source's path prefix.
    pub rules: Vec<FetchedRule>,
}

/// Fetches and parses a [`RuleSource`] at its configured ref.
///
/// Implementations own the clone/checkout and file parsing; the catalog
/// only needs the resulting rule set and the commit it was taken from.
pub trait RuleSourceFetcher: Send + Sync {
    /// Fetch `source` at its configured git ref.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be reached or parsed.
    fn fetch(&self, source: &RuleSource) -> CoreResult<FetchResult>;
}

/// Outcome of a single sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// `true` if the sync was skipped because `commit_hash` was unchanged.
    pub skipped_unchanged: bool,
    /// Number of rules newly inserted or updated.
    pub upserted: usize,
    /// Number of previously-known rules from this source now tombstoned.
    pub tombstoned: usize,
}

/// Sync one rule source into the catalog.
///
/// Idempotent keyed on `(rule_source_id, commit_hash)`: if `source`'s
/// `last_commit_hash` matches the freshly fetched commit, the sync is a
/// no-op. Otherwise every rule from the fetch is upserted, and any
/// previously-cataloged rule from this source absent from the new fetch is
/// tombstoned rather than deleted, so historical jobs referencing it
/// remain explainable.
///
/// # Errors
///
/// Returns an error if the fetch fails or the record store cannot be
/// written to.
pub fn sync_source(
    store: &dyn RecordStore<Rule>,
    source: &RuleSource,
    fetcher: &dyn RuleSourceFetcher,
) -> CoreResult<SyncOutcome> {
    let fetched = fetcher.fetch(source)?;
    if source.last_commit_hash.as_deref() == Some(fetched.commit_hash.as_str()) {
        tracing::debug!(
            target: "rcx.catalog.sync",
            rule_source_id = %source.rule_source_id,
            commit_hash = %fetched.commit_hash,
            "sync skipped, commit unchanged"
        );
        return Ok(SyncOutcome {
            skipped_unchanged: true,
            ..Default::default()
        });
    }

    let previous_ids = store
        .scan_prefix("")?
        .into_iter()
        .filter_map(|key| {
            store.get(&key).ok().flatten().and_then(|rec| {
                if rec.value.rule_source_id == source.rule_source_id && !rec.value.tombstoned {
                    Some(rec.value.rule_id)
                } else {
                    None
                }
            })
        })
        .collect::<std::collections::BTreeSet<_>>();

    let mut seen = std::collections::BTreeSet::new();
    let mut upserted = 0usize;
    for fetched_rule in fetched.rules {
        let rule = fetched_rule.rule;
        seen.insert(rule.rule_id.clone());
        let expected_version = store.get(&rule.rule_id)?.map(|r| r.version);
        let rule_id = rule.rule_id.clone();
        store.put(&rule_id, rule, expected_version)?;
        upserted += 1;
    }

    let mut tombstoned = 0usize;
    for rule_id in previous_ids.difference(&seen) {
        if let Some(existing) = store.get(rule_id)? {
            let mut rule = existing.value;
            rule.tombstoned = true;
            store.put(rule_id, rule, Some(existing.version))?;
            tombstoned += 1;
        }
    }

    tracing::info!(
        target: "rcx.catalog.sync",
        rule_source_id = %source.rule_source_id,
        commit_hash = %fetched.commit_hash,
        upserted,
        tombstoned,
        "catalog sync complete"
    );
    Ok(SyncOutcome {
        skipped_unchanged: false,
        upserted,
        tombstoned,
    })
}

/// Query filters for [`query_rules`]. Every field is an optional exact
/// match; `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    /// Restrict to a single cloud.
    pub cloud: Option<CloudKind>,
    /// Restrict to rules tagged with this compliance standard.
    pub standard: Option<String>,
    /// Restrict to a minimum severity.
    pub min_severity: Option<Severity>,
    /// Restrict to a service name.
    pub service: Option<String>,
    /// Restrict to a resource type.
    pub resource_type: Option<String>,
    /// Include tombstoned rules. Defaults to `false`.
    pub include_tombstoned: bool,
}

/// Opaque pagination cursor. Callers must treat this as a black box and
/// only round-trip it back into [`query_rules`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(String);

#[derive(Serialize, Deserialize)]
struct CursorPayload {
    after_rule_id: String,
}

impl Cursor {
    fn encode(after_rule_id: &str) -> Self {
        let payload = CursorPayload {
            after_rule_id: after_rule_id.to_string(),
        };
        let json = serde_json::to_vec(&payload).expect("cursor payload always serializes");
        Cursor(base64::engine::general_purpose::STANDARD.encode(json))
    }

    fn decode(&self) -> CoreResult<CursorPayload> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.0)
            .map_err(|e| CoreError::new(ErrorKind::Validation, format!("malformed cursor: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::new(ErrorKind::Validation, format!("malformed cursor: {e}")))
    }
}

/// A page of query results.
#[derive(Debug, Clone)]
pub struct RulePage {
    /// The matching rules, ordered by `rule_id`.
    pub rules: Vec<Rule>,
    /// Opaque cursor for the next page, `None` once exhausted.
    pub next_cursor: Option<Cursor>,
}

/// Query the catalog by cloud, standard, severity, service, and resource
/// type, paginated with an opaque cursor.
///
/// # Errors
///
/// Returns an error if the cursor is malformed or the store cannot be read.
pub fn query_rules(
    store: &dyn RecordStore<Rule>,
    filter: &RuleFilter,
    cursor: Option<&Cursor>,
    page_size: usize,
) -> CoreResult<RulePage> {
    let after = match cursor {
        Some(c) => Some(c.decode()?.after_rule_id),
        None => None,
    };

    let mut ids = store.scan_prefix("")?;
    ids.sort();

    let mut matched = Vec::new();
    for id in ids {
        if let Some(after) = &after {
            if id.as_str() <= after.as_str() {
                continue;
            }
        }
        let Some(record) = store.get(&id)? else {
            continue;
        };
        let rule = record.value;
        if !filter.include_tombstoned && rule.tombstoned {
            continue;
        }
        if let Some(cloud) = filter.cloud {
            if rule.cloud != cloud {
                continue;
            }
        }
        if let Some(standard) = &filter.standard {
            if !rule.standards.contains_key(standard) {
                continue;
            }
        }
        if let Some(min_severity) = filter.min_severity {
            if rule.severity < min_severity {
                continue;
            }
        }
        if let Some(service) = &filter.service {
            if &rule.service != service {
                continue;
            }
        }
        if let Some(resource_type) = &filter.resource_type {
            if &rule.resource_type != resource_type {
                continue;
            }
        }
        matched.push(rule);
        if matched.len() == page_size {
            break;
        }
    }

    let next_cursor = matched.last().map(|r| Cursor::encode(&r.rule_id));
    let next_cursor = if matched.len() < page_size { None } else { next_cursor };
    Ok(RulePage {
        rules: matched,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcx_core::{CloudKind, Rule, Severity};
    use rcx_store::InMemoryRecordStore;
    use std::collections::BTreeMap;

    fn rule(id: &str, source_id: &str, severity: Severity) -> Rule {
        Rule {
            rule_id: id.to_string(),
            version: 1,
            cloud: CloudKind::Aws,
            resource_type: "s3_bucket".into(),
            severity,
            description: "example".into(),
            service: "s3".into(),
            standards: BTreeMap::new(),
            mitre: BTreeMap::new(),
            tombstoned: false,
            rule_source_id: source_id.to_string(),
        }
    }

    struct FixedFetcher {
        result: FetchResult,
    }

    impl RuleSourceFetcher for FixedFetcher {
        fn fetch(&self, _source: &RuleSource) -> CoreResult<FetchResult> {
            Ok(self.result.clone())
        }
    }

    fn sample_source() -> RuleSource {
        RuleSource {
            rule_source_id: "src-1".into(),
            url: "https://example.invalid/rules.git".into(),
            git_ref: "main".into(),
            path_prefix: "rules/".into(),
            sealed_secret_ref: None,
            customer_id: "cust-1".into(),
            allow_tenants: Default::default(),
            restrict_tenants: Default::default(),
            last_commit_hash: None,
        }
    }

    #[test]
    fn sync_skips_when_commit_unchanged() {
        let store: InMemoryRecordStore<Rule> = InMemoryRecordStore::new();
        let mut source = sample_source();
        source.last_commit_hash = Some("abc".into());
        let fetcher = FixedFetcher {
            result: FetchResult {
                commit_hash: "abc".into(),
                rules: vec![],
            },
        };
        let outcome = sync_source(&store, &source, &fetcher).unwrap();
        assert!(outcome.skipped_unchanged);
    }

    #[test]
    fn sync_tombstones_rules_missing_from_newer_fetch() {
        let store: InMemoryRecordStore<Rule> = InMemoryRecordStore::new();
        let source = sample_source();
        let fetcher_v1 = FixedFetcher {
            result: FetchResult {
                commit_hash: "v1".into(),
                rules: vec![FetchedRule {
                    rule: rule("r1", "src-1", Severity::High),
                }],
            },
        };
        sync_source(&store, &source, &fetcher_v1).unwrap();

        let fetcher_v2 = FixedFetcher {
            result: FetchResult {
                commit_hash: "v2".into(),
                rules: vec![],
            },
        };
        let outcome = sync_source(&store, &source, &fetcher_v2).unwrap();
        assert_eq!(outcome.tombstoned, 1);

        let stored = store.get("r1").unwrap().unwrap().value;
        assert!(stored.tombstoned);
    }

    #[test]
    fn query_filters_by_severity_and_paginates() {
        let store: InMemoryRecordStore<Rule> = InMemoryRecordStore::new();
        for (id, sev) in [
            ("r1", Severity::Low),
            ("r2", Severity::High),
            ("r3", Severity::Critical),
        ] {
            store.put(id, rule(id, "src-1", sev), None).unwrap();
        }
        let filter = RuleFilter {
            min_severity: Some(Severity::High),
            ..Default::default()
        };
        let page = query_rules(&store, &filter, None, 1).unwrap();
        assert_eq!(page.rules.len(), 1);
        assert_eq!(page.rules[0].rule_id, "r2");
        assert!(page.next_cursor.is_some());

        let page2 = query_rules(&store, &filter, page.next_cursor.as_ref(), 1).unwrap();
        assert_eq!(page2.rules.len(), 1);
        assert_eq!(page2.rules[0].rule_id, "r3");
        assert!(page2.next_cursor.is_none());
    }
}
