//! Label-selector requirements and their set algebra.
//!
//! A [`Requirement`] is one `(key, operator, values)` constraint. A
//! [`Requirements`] bag groups them by key and keeps, per key, the effective
//! allowed value set after intersecting everything added so far. The bag is
//! the currency of scheduling: pods carry one, node pools carry one, node
//! templates accumulate one, and compatibility checks between them decide
//! where a pod may land.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A label-selector operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    /// The label value must be one of the listed values.
    In,
    /// The label value must not be one of the listed values.
    NotIn,
    /// The label must be present, any value.
    Exists,
    /// The label must be absent.
    DoesNotExist,
    /// The label value, parsed as an integer, must be strictly greater.
    Gt,
    /// The label value, parsed as an integer, must be strictly less.
    Lt,
}

impl Operator {
    /// Parse the Kubernetes string form of an operator.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "In" => Some(Self::In),
            "NotIn" => Some(Self::NotIn),
            "Exists" => Some(Self::Exists),
            "DoesNotExist" => Some(Self::DoesNotExist),
            "Gt" => Some(Self::Gt),
            "Lt" => Some(Self::Lt),
            _ => None,
        }
    }
}

/// A single `(key, operator, values)` constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    /// The label key being constrained.
    pub key: String,
    /// The operator.
    pub operator: Operator,
    /// Operand values; empty for Exists/DoesNotExist, one value for Gt/Lt.
    pub values: Vec<String>,
}

impl Requirement {
    /// Create a requirement.
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Shorthand for an `In` requirement.
    pub fn in_values(
        key: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::new(key, Operator::In, values)
    }

    /// Shorthand for an `Exists` requirement.
    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, Operator::Exists, Vec::<String>::new())
    }

    /// Convert a Kubernetes `NodeSelectorRequirement`. Returns `None` for an
    /// operator this engine does not understand.
    pub fn from_node_selector_requirement(req: &NodeSelectorRequirement) -> Option<Self> {
        let operator = Operator::parse(&req.operator)?;
        Some(Self {
            key: req.key.clone(),
            operator,
            values: req.values.clone().unwrap_or_default(),
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {:?}", self.key, self.operator, self.values)
    }
}

/// The effective allowed set for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Allowed {
    /// Any value is allowed except those explicitly excluded (Exists, NotIn).
    Any {
        /// Values removed by NotIn constraints.
        excluded: BTreeSet<String>,
    },
    /// Only the listed values are allowed (In). Empty means unsatisfiable.
    Only(BTreeSet<String>),
    /// The key must not exist on the node (DoesNotExist).
    Never,
}

/// The intersected constraint state for a single key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRequirement {
    key: String,
    allowed: Allowed,
    /// Exclusive lower bound from Gt.
    greater_than: Option<i64>,
    /// Exclusive upper bound from Lt.
    less_than: Option<i64>,
}

/// The enumerable allowed values for a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Values {
    /// Unbounded; any value satisfies the key.
    Any,
    /// The exact allowed set.
    Of(BTreeSet<String>),
}

/// Error describing why two requirement bags cannot coexist.
#[derive(Debug, Error)]
#[error("incompatible requirements: {0}")]
pub struct Incompatible(
    /// The conflicting key and value sets.
    pub String,
);

impl KeyRequirement {
    fn unconstrained(key: &str) -> Self {
        Self {
            key: key.to_string(),
            allowed: Allowed::Any { excluded: BTreeSet::new() },
            greater_than: None,
            less_than: None,
        }
    }

    fn from_requirement(req: &Requirement) -> Self {
        let mut out = Self::unconstrained(&req.key);
        match req.operator {
            Operator::In => {
                out.allowed = Allowed::Only(req.values.iter().cloned().collect());
            }
            Operator::NotIn => {
                out.allowed = Allowed::Any { excluded: req.values.iter().cloned().collect() };
            }
            Operator::Exists => {}
            Operator::DoesNotExist => out.allowed = Allowed::Never,
            Operator::Gt => {
                // An unparsable bound can never be satisfied.
                match req.values.first().and_then(|v| v.parse::<i64>().ok()) {
                    Some(bound) => out.greater_than = Some(bound),
                    None => out.allowed = Allowed::Only(BTreeSet::new()),
                }
            }
            Operator::Lt => match req.values.first().and_then(|v| v.parse::<i64>().ok()) {
                Some(bound) => out.less_than = Some(bound),
                None => out.allowed = Allowed::Only(BTreeSet::new()),
            },
        }
        out
    }

    /// The key this requirement constrains.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn within_bounds(&self, value: &str) -> bool {
        if self.greater_than.is_none() && self.less_than.is_none() {
            return true;
        }
        let Ok(numeric) = value.parse::<i64>() else {
            return false;
        };
        self.greater_than.map_or(true, |b| numeric > b)
            && self.less_than.map_or(true, |b| numeric < b)
    }

    /// Membership test for a concrete label value, respecting NotIn and
    /// numeric bounds.
    pub fn intersects_value(&self, value: &str) -> bool {
        let allowed = match &self.allowed {
            Allowed::Any { excluded } => !excluded.contains(value),
            Allowed::Only(set) => set.contains(value),
            Allowed::Never => false,
        };
        allowed && self.within_bounds(value)
    }

    /// The enumerable allowed values. Unbounded keys (Exists or NotIn only)
    /// report [`Values::Any`]; `DoesNotExist` reports an empty set.
    pub fn values(&self) -> Values {
        match &self.allowed {
            Allowed::Any { .. } => Values::Any,
            Allowed::Only(set) => Values::Of(
                set.iter().filter(|v| self.within_bounds(v)).cloned().collect(),
            ),
            Allowed::Never => Values::Of(BTreeSet::new()),
        }
    }

    /// True if some label value (or absence, for `DoesNotExist`) can satisfy
    /// this key.
    pub fn is_satisfiable(&self) -> bool {
        match &self.allowed {
            Allowed::Never => true,
            Allowed::Any { .. } => match (self.greater_than, self.less_than) {
                (Some(gt), Some(lt)) => gt + 1 < lt,
                _ => true,
            },
            Allowed::Only(set) => set.iter().any(|v| self.within_bounds(v)),
        }
    }

    /// True if the key is pinned to exactly one value.
    pub fn single_value(&self) -> Option<&str> {
        match &self.allowed {
            Allowed::Only(set) if set.len() == 1 => {
                set.iter().next().map(String::as_str).filter(|v| self.within_bounds(v))
            }
            _ => None,
        }
    }

    fn intersection(&self, other: &KeyRequirement) -> KeyRequirement {
        let allowed = match (&self.allowed, &other.allowed) {
            (Allowed::Never, Allowed::Never) => Allowed::Never,
            // DoesNotExist against anything that needs the key present.
            (Allowed::Never, _) | (_, Allowed::Never) => Allowed::Only(BTreeSet::new()),
            (Allowed::Any { excluded: a }, Allowed::Any { excluded: b }) => {
                Allowed::Any { excluded: a.union(b).cloned().collect() }
            }
            // Exists/NotIn never widens an In-restricted set.
            (Allowed::Only(set), Allowed::Any { excluded })
            | (Allowed::Any { excluded }, Allowed::Only(set)) => {
                Allowed::Only(set.difference(excluded).cloned().collect())
            }
            (Allowed::Only(a), Allowed::Only(b)) => {
                Allowed::Only(a.intersection(b).cloned().collect())
            }
        };
        KeyRequirement {
            key: self.key.clone(),
            allowed,
            greater_than: match (self.greater_than, other.greater_than) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            less_than: match (self.less_than, other.less_than) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }

    fn describe_conflict(&self, other: &KeyRequirement) -> String {
        format!("key {} has no values satisfying both {:?} and {:?}", self.key, self, other)
    }
}

/// A bag of requirements grouped by key.
///
/// Adding a requirement intersects it with whatever the bag already holds
/// for that key. An empty intersection makes the bag unsatisfiable but the
/// conflict is retained for diagnostics rather than panicking or erroring.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements {
    keys: BTreeMap<String, KeyRequirement>,
    conflicts: Vec<String>,
}

impl Requirements {
    /// Create an empty bag (compatible with everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bag from node labels, one `In` requirement per label.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let mut out = Self::new();
        for (key, value) in labels {
            out.add(Requirement::in_values(key.clone(), [value.clone()]));
        }
        out
    }

    /// Add a requirement, intersecting with the existing constraint on its
    /// key. Records a conflict if the intersection becomes empty.
    pub fn add(&mut self, requirement: Requirement) {
        let incoming = KeyRequirement::from_requirement(&requirement);
        match self.keys.get(&requirement.key) {
            Some(existing) => {
                let merged = existing.intersection(&incoming);
                if !merged.is_satisfiable() {
                    self.conflicts.push(existing.describe_conflict(&incoming));
                }
                self.keys.insert(requirement.key, merged);
            }
            None => {
                if !incoming.is_satisfiable() {
                    self.conflicts.push(format!("key {} is unsatisfiable", requirement.key));
                }
                self.keys.insert(requirement.key, incoming);
            }
        }
    }

    /// Intersect another bag into this one.
    pub fn merge(&mut self, other: &Requirements) {
        for existing in other.keys.values() {
            match self.keys.get(existing.key()) {
                Some(mine) => {
                    let merged = mine.intersection(existing);
                    if !merged.is_satisfiable() {
                        self.conflicts.push(mine.describe_conflict(existing));
                    }
                    self.keys.insert(existing.key().to_string(), merged);
                }
                None => {
                    self.keys.insert(existing.key().to_string(), existing.clone());
                }
            }
        }
        self.conflicts.extend(other.conflicts.iter().cloned());
    }

    /// True iff for every shared key the intersection is non-empty, and
    /// neither bag is already unsatisfiable.
    pub fn compatible(&self, other: &Requirements) -> Result<(), Incompatible> {
        if let Some(conflict) = self.conflicts.first().or_else(|| other.conflicts.first()) {
            return Err(Incompatible(conflict.clone()));
        }
        for (key, mine) in &self.keys {
            if let Some(theirs) = other.keys.get(key) {
                let merged = mine.intersection(theirs);
                if !merged.is_satisfiable() {
                    return Err(Incompatible(mine.describe_conflict(theirs)));
                }
            }
        }
        Ok(())
    }

    /// Get the constraint for a key, if any.
    pub fn get(&self, key: &str) -> Option<&KeyRequirement> {
        self.keys.get(key)
    }

    /// True if the bag constrains the key at all.
    pub fn has(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Membership test: does `value` satisfy the constraint on `key`?
    /// Unconstrained keys accept everything.
    pub fn intersects(&self, key: &str, value: &str) -> bool {
        self.keys.get(key).map_or(true, |req| req.intersects_value(value))
    }

    /// True if no added requirement produced an empty intersection and every
    /// key individually still has satisfying values.
    pub fn is_satisfiable(&self) -> bool {
        self.conflicts.is_empty() && self.keys.values().all(KeyRequirement::is_satisfiable)
    }

    /// The recorded conflicts, oldest first.
    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    /// Iterate over the constrained keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// The labels this bag pins to a single value, e.g. to render onto a
    /// node created from a template.
    pub fn single_valued_labels(&self) -> BTreeMap<String, String> {
        self.keys
            .values()
            .filter_map(|req| req.single_value().map(|v| (req.key().to_string(), v.to_string())))
            .collect()
    }

    /// True iff the label map satisfies every constraint in the bag.
    /// `DoesNotExist` keys require the label to be absent.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.keys.values().all(|req| match labels.get(req.key()) {
            Some(value) => req.intersects_value(value),
            None => matches!(req.allowed, Allowed::Never),
        })
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut out = Self::new();
        for req in iter {
            out.add(req);
        }
        out
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for req in self.keys.values() {
            if !first {
                write!(f, ", ")?;
            }
            match req.values() {
                Values::Any => write!(f, "{} exists", req.key())?,
                Values::Of(set) => write!(f, "{} in {:?}", req.key(), set)?,
            }
            first = false;
        }
        Ok(())
    }
}
