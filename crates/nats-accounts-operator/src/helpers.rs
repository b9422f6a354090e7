//! Selector evaluation and signing-key set maintenance.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use crate::crds::common::SigningKeyEmbeddedStatus;
use crate::crds::signing_key::SigningKey;

/// Evaluates a label selector against a label set. Empty selectors match
/// everything, mirroring `metav1.LabelSelectorAsSelector`.
pub fn label_selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.as_deref().unwrap_or(&[]);
            let found = labels.get(&expr.key);
            let matched = match expr.operator.as_str() {
                "In" => found.is_some_and(|v| values.iter().any(|x| x == v)),
                "NotIn" => found.is_none_or(|v| !values.iter().any(|x| x == v)),
                "Exists" => found.is_some(),
                "DoesNotExist" => found.is_none(),
                other => return Err(format!("unsupported selector operator {other:?}")),
            };
            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

/// A nil selector is equivalent to an empty one here: both admit everything.
/// Used for `signingKeysSelector` and `usersSelector` style fields.
pub fn selector_admits(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool, String> {
    match selector {
        None => Ok(true),
        Some(s) => label_selector_matches(s, labels),
    }
}

/// Namespace admission differs from plain selectors: a nil selector
/// restricts children to the parent's own namespace, while an empty
/// selector admits any namespace.
pub fn namespace_selector_admits(
    parent_namespace: &str,
    selector: Option<&LabelSelector>,
    namespace: &Namespace,
) -> Result<bool, String> {
    match selector {
        None => Ok(namespace.name_any() == parent_namespace),
        Some(s) => label_selector_matches(s, namespace.labels()),
    }
}

/// Computes the next signing-keys list for an owner, preserving the order of
/// already-known entries so a stable eligible set never rewrites the status.
/// Entries absent from the eligible set are dropped; newly-eligible keys are
/// appended in discovery order. Eligibility requires the key to be Ready and
/// owned (by uid) by this resource.
pub fn next_signing_keys(
    owner_uid: &str,
    current: &[SigningKeyEmbeddedStatus],
    discovered: &[SigningKey],
) -> Vec<SigningKeyEmbeddedStatus> {
    let mut eligible: Vec<SigningKeyEmbeddedStatus> = Vec::new();
    for sk in discovered {
        if !sk.is_ready() {
            continue;
        }
        let owned = sk
            .owner_ref()
            .and_then(|r| r.uid.as_deref())
            .is_some_and(|uid| uid == owner_uid);
        if !owned {
            continue;
        }
        if let Some(key_pair) = sk.key_pair() {
            eligible.push(SigningKeyEmbeddedStatus {
                name: sk.name_any(),
                key_pair: key_pair.clone(),
            });
        }
    }

    let mut next: Vec<SigningKeyEmbeddedStatus> = Vec::with_capacity(eligible.len());
    for existing in current {
        if let Some(updated) = eligible.iter().find(|e| e.name == existing.name) {
            next.push(updated.clone());
        }
    }
    for candidate in &eligible {
        if !current.iter().any(|c| c.name == candidate.name) {
            next.push(candidate.clone());
        }
    }

    next
}

/// Parses a short duration literal ("500ms", "5s", "1m", "2h") into
/// nanoseconds for JWT TTL claims.
pub fn parse_duration_ns(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
    let (value, unit) = s.split_at(split);
    let value: i64 = value
        .parse()
        .map_err(|_| format!("invalid duration value {s:?}"))?;
    let scale: i64 = match unit {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        other => return Err(format!("unsupported duration unit {other:?}")),
    };
    Ok(value * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(label_selector_matches(&selector, &labels(&[("a", "b")])).unwrap());
        assert!(label_selector_matches(&selector, &BTreeMap::new()).unwrap());
    }

    #[test]
    fn match_labels_are_conjunctive() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("tier", "tenant"), ("env", "prod")])),
            ..Default::default()
        };
        assert!(label_selector_matches(&selector, &labels(&[("tier", "tenant"), ("env", "prod")])).unwrap());
        assert!(!label_selector_matches(&selector, &labels(&[("tier", "tenant")])).unwrap());
    }

    #[test]
    fn match_expressions_operators() {
        let selector = LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: "In".into(),
                    values: Some(vec!["prod".into(), "staging".into()]),
                },
                LabelSelectorRequirement {
                    key: "legacy".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
            ..Default::default()
        };
        assert!(label_selector_matches(&selector, &labels(&[("env", "prod")])).unwrap());
        assert!(!label_selector_matches(&selector, &labels(&[("env", "dev")])).unwrap());
        assert!(!label_selector_matches(&selector, &labels(&[("env", "prod"), ("legacy", "1")])).unwrap());
    }

    #[test]
    fn invalid_operator_is_an_error() {
        let selector = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: "Near".into(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(label_selector_matches(&selector, &BTreeMap::new()).is_err());
    }

    #[test]
    fn nil_namespace_selector_means_same_namespace() {
        let mut ns = Namespace::default();
        ns.metadata.name = Some("tenants".into());

        assert!(namespace_selector_admits("tenants", None, &ns).unwrap());
        assert!(!namespace_selector_admits("control-plane", None, &ns).unwrap());
        // empty selector admits any namespace
        let empty = LabelSelector::default();
        assert!(namespace_selector_admits("control-plane", Some(&empty), &ns).unwrap());
    }

    #[test]
    fn durations_parse_to_nanoseconds() {
        assert_eq!(parse_duration_ns("500ms").unwrap(), 500_000_000);
        assert_eq!(parse_duration_ns("5s").unwrap(), 5_000_000_000);
        assert_eq!(parse_duration_ns("1m").unwrap(), 60_000_000_000);
        assert!(parse_duration_ns("5 parsecs").is_err());
        assert!(parse_duration_ns("5").is_err());
    }

    mod signing_keys {
        use super::*;
        use crate::conditions::{CONDITION_OWNER_RESOLVED, CONDITION_SEED_SECRET_READY};
        use crate::crds::common::{
            API_VERSION, KeyPair, SigningKeyOwnerReference, TypedObjectReference,
        };
        use crate::crds::signing_key::{
            SIGNING_KEY_CONDITIONS, SigningKey, SigningKeySpec, SigningKeyStatus, SigningKeyType,
        };

        fn signing_key(name: &str, owner_uid: &str, ready: bool) -> SigningKey {
            let mut status = SigningKeyStatus::default();
            status.initialize_conditions();
            status.mark_owner_resolved(TypedObjectReference {
                api_version: API_VERSION.into(),
                kind: "Account".into(),
                name: "owner".into(),
                namespace: Some("default".into()),
                uid: Some(owner_uid.into()),
            });
            if ready {
                status.mark_seed_secret_ready(KeyPair {
                    public_key: format!("A{}", name.to_uppercase()),
                    seed_secret_name: format!("{name}-seed"),
                });
            } else {
                SIGNING_KEY_CONDITIONS.mark_unknown(
                    &mut status.conditions,
                    CONDITION_SEED_SECRET_READY,
                    "NotReady",
                    "pending",
                );
            }
            assert!(
                status
                    .conditions
                    .iter()
                    .any(|c| c.r#type == CONDITION_OWNER_RESOLVED)
            );

            let mut sk = SigningKey::new(
                name,
                SigningKeySpec {
                    r#type: SigningKeyType::Account,
                    seed_secret_name: format!("{name}-seed"),
                    owner_ref: SigningKeyOwnerReference {
                        api_version: API_VERSION.into(),
                        kind: "Account".into(),
                        name: "owner".into(),
                    },
                },
            );
            sk.status = Some(status);
            sk
        }

        fn embedded(name: &str) -> SigningKeyEmbeddedStatus {
            SigningKeyEmbeddedStatus {
                name: name.into(),
                key_pair: KeyPair {
                    public_key: format!("A{}", name.to_uppercase()),
                    seed_secret_name: format!("{name}-seed"),
                },
            }
        }

        #[test]
        fn stable_sets_preserve_order() {
            let current = vec![embedded("sk-b"), embedded("sk-a")];
            let discovered = vec![
                signing_key("sk-a", "uid-1", true),
                signing_key("sk-b", "uid-1", true),
            ];
            let next = next_signing_keys("uid-1", &current, &discovered);
            let names: Vec<&str> = next.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["sk-b", "sk-a"]);
        }

        #[test]
        fn new_keys_append_and_stale_keys_drop() {
            let current = vec![embedded("sk-gone"), embedded("sk-a")];
            let discovered = vec![
                signing_key("sk-a", "uid-1", true),
                signing_key("sk-new", "uid-1", true),
            ];
            let next = next_signing_keys("uid-1", &current, &discovered);
            let names: Vec<&str> = next.iter().map(|e| e.name.as_str()).collect();
            assert_eq!(names, vec!["sk-a", "sk-new"]);
        }

        #[test]
        fn foreign_and_unready_keys_are_ignored() {
            let discovered = vec![
                signing_key("sk-foreign", "uid-2", true),
                signing_key("sk-pending", "uid-1", false),
            ];
            assert!(next_signing_keys("uid-1", &[], &discovered).is_empty());
        }
    }
}
