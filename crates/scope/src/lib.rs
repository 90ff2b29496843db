//! Scope algebra (spec.md §4.1, component C1).
//!
//! A [`ScopeMap`] describes per-row access: each scope-key maps to either a
//! single value, a finite set of values, or the wildcard sentinel `*`. The
//! algebra is used twice: to authorize pushed operations (intersecting a
//! handler's `resolveScopes` output with the row's `extractScopes`) and to
//! filter pulled changes against a subscription's requested scopes.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use errors::SyncError;
use serde::{
    Deserialize,
    Serialize,
};

/// One scope-key's value: a single string, a finite set, or `*` (any value
/// allowed / any value present, depending on which side of an intersection
/// it appears on).
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    Wildcard(WildcardMarker),
    Single(String),
    Set(BTreeSet<String>),
}

/// Serializes/deserializes as the literal string `"*"`.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WildcardMarker;

impl Serialize for WildcardMarker {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("*")
    }
}

impl<'de> Deserialize<'de> for WildcardMarker {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            Ok(WildcardMarker)
        } else {
            Err(serde::de::Error::custom("expected wildcard sentinel \"*\""))
        }
    }
}

impl ScopeValue {
    pub fn wildcard() -> Self {
        ScopeValue::Wildcard(WildcardMarker)
    }

    pub fn single(v: impl Into<String>) -> Self {
        ScopeValue::Single(v.into())
    }

    pub fn set(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ScopeValue::Set(values.into_iter().map(Into::into).collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, ScopeValue::Wildcard(_))
    }

    pub fn is_empty_set(&self) -> bool {
        matches!(self, ScopeValue::Set(s) if s.is_empty())
    }

    /// The set of concrete values this represents; `None` for wildcard,
    /// which has no enumerable value set.
    pub fn values(&self) -> Option<BTreeSet<&str>> {
        match self {
            ScopeValue::Wildcard(_) => None,
            ScopeValue::Single(v) => Some(BTreeSet::from([v.as_str()])),
            ScopeValue::Set(s) => Some(s.iter().map(String::as_str).collect()),
        }
    }

    fn contains(&self, value: &str) -> bool {
        match self {
            ScopeValue::Wildcard(_) => true,
            ScopeValue::Single(v) => v == value,
            ScopeValue::Set(s) => s.contains(value),
        }
    }

    /// Canonical sorted form for display/hashing: `*` for wildcard, the bare
    /// value for a single, or a comma-joined sorted list for a set.
    fn canonical(&self) -> String {
        match self {
            ScopeValue::Wildcard(_) => "*".to_string(),
            ScopeValue::Single(v) => v.clone(),
            ScopeValue::Set(s) => s.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

/// A scope map: scope-key -> [`ScopeValue`]. Serializes as a plain JSON
/// object, matching the wire `ScopeMap` referenced throughout spec.md §6.
pub type ScopeMap = BTreeMap<String, ScopeValue>;

/// Intersect a `requested` scope against the caller's `allowed` scope.
///
/// For every key in `requested`:
/// - if `allowed[key]` is the wildcard, the requested value passes through
///   unchanged;
/// - if `allowed[key]` is an empty set, the whole subscription is revoked
///   (`None` is returned);
/// - otherwise the two value sets are intersected.
///
/// A key present in `requested` but absent from `allowed` is treated the
/// same as an empty-set `allowed` entry (revoked) — callers that need to
/// distinguish "unknown key" from "revoked" should validate key vocabularies
/// with [`validate_known_keys`] first, per spec.md §4.1's
/// `InvalidSubscriptionScope` rule.
pub fn intersect(requested: &ScopeMap, allowed: &ScopeMap) -> Option<ScopeMap> {
    let mut out = ScopeMap::new();
    for (key, req_value) in requested {
        let Some(allowed_value) = allowed.get(key) else {
            return None;
        };
        if allowed_value.is_empty_set() {
            return None;
        }
        if allowed_value.is_wildcard() {
            out.insert(key.clone(), req_value.clone());
            continue;
        }
        match (req_value, allowed_value) {
            (ScopeValue::Wildcard(_), other) => {
                // Requesting "any value" narrowed by a concrete allowed set
                // yields the allowed set itself.
                out.insert(key.clone(), other.clone());
            },
            _ => {
                let req_values = req_value.values().unwrap_or_default();
                let allowed_values = allowed_value.values().unwrap_or_default();
                let narrowed: BTreeSet<String> = req_values
                    .intersection(&allowed_values)
                    .map(|s| s.to_string())
                    .collect();
                if narrowed.is_empty() {
                    return None;
                }
                out.insert(key.clone(), ScopeValue::Set(narrowed));
            },
        }
    }
    Some(out)
}

/// `true` iff every key in `requested` is present in `change_scopes` with a
/// value contained in the requested set (any value counts when the
/// requested side is wildcard).
pub fn matches(change_scopes: &ScopeMap, requested: &ScopeMap) -> bool {
    requested.iter().all(|(key, req_value)| {
        let Some(change_value) = change_scopes.get(key) else {
            return false;
        };
        match (req_value, change_value.values()) {
            (ScopeValue::Wildcard(_), _) => true,
            (_, None) => true, // change side is wildcard: any requested value matches
            (_, Some(change_values)) => change_values.iter().any(|v| req_value.contains(v)),
        }
    })
}

/// Canonical string form used as the snapshot-chunk cache partition and the
/// realtime notification bucket identifier: keys sorted lexicographically,
/// set values sorted, single values preserved verbatim.
pub fn scope_key(scope: &ScopeMap) -> String {
    scope
        .iter()
        .map(|(k, v)| format!("{k}={}", v.canonical()))
        .collect::<Vec<_>>()
        .join(";")
}

/// Validates that every key on either side of a subscription request is
/// declared by the handler's scope-key vocabulary (the set of `varName`s
/// extracted from its scope patterns, spec.md §4.4). Returns
/// `InvalidSubscriptionScope` naming the first offending key.
pub fn validate_known_keys(
    requested: &ScopeMap,
    allowed: &ScopeMap,
    declared_keys: &BTreeSet<String>,
) -> Result<(), SyncError> {
    for key in requested.keys().chain(allowed.keys()) {
        if !declared_keys.contains(key) {
            return Err(SyncError::invalid_subscription_scope(format!(
                "scope key \"{key}\" is not declared by this table's scope patterns"
            )));
        }
    }
    Ok(())
}
