//! Label requirement algebra
//!
//! Implements the per-key value algebra behind node constraints:
//! - **ConstraintExpression**: a single posted constraint (In, NotIn, Exists,
//!   DoesNotExist, Gt, Lt)
//! - **Requirement**: the feasible values for one key under the conjunction
//!   of all posted constraints
//! - **Requirements**: an intersectable set of requirements keyed by label
//!
//! `NotIn` stays cofinite (universe minus excluded); it is never collapsed to
//! an enumeration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkyliftError};

/// Operator of a posted constraint expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpressionOperator {
    /// Key's value must be in values
    In,
    /// Key's value must not be in values
    NotIn,
    /// Key must exist
    Exists,
    /// Key must not exist
    DoesNotExist,
    /// Key's value must be greater than
    Gt,
    /// Key's value must be less than
    Lt,
}

/// A single label constraint posted by a workload or template
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstraintExpression {
    /// Key to match
    pub key: String,
    /// Operator
    pub operator: ExpressionOperator,
    /// Values to match against
    pub values: Vec<String>,
}

impl ConstraintExpression {
    /// Create a new expression
    pub fn new(key: impl Into<String>, operator: ExpressionOperator, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    /// Shorthand for an `In` expression
    pub fn within(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(key, ExpressionOperator::In, values.into_iter().map(Into::into).collect())
    }

    /// Shorthand for a `NotIn` expression
    pub fn without(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(key, ExpressionOperator::NotIn, values.into_iter().map(Into::into).collect())
    }

    /// Evaluate this expression against a concrete label map
    pub fn evaluate(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);

        match self.operator {
            ExpressionOperator::In => value.map(|v| self.values.contains(v)).unwrap_or(false),
            ExpressionOperator::NotIn => value.map(|v| !self.values.contains(v)).unwrap_or(true),
            ExpressionOperator::Exists => value.is_some(),
            ExpressionOperator::DoesNotExist => value.is_none(),
            ExpressionOperator::Gt => self.compare(value, |v, t| v > t),
            ExpressionOperator::Lt => self.compare(value, |v, t| v < t),
        }
    }

    fn compare(&self, value: Option<&String>, cmp: impl Fn(i64, i64) -> bool) -> bool {
        if let (Some(v), Some(threshold)) = (value, self.values.first()) {
            v.parse::<i64>()
                .ok()
                .zip(threshold.parse::<i64>().ok())
                .map(|(v, t)| cmp(v, t))
                .unwrap_or(false)
        } else {
            false
        }
    }
}

/// The feasible value set for a single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSet {
    /// A finite allowed set (In)
    Only(BTreeSet<String>),
    /// The universe minus excluded values, optionally bounded numerically
    /// (NotIn, Exists, Gt, Lt)
    AnyExcept {
        /// Disallowed values
        excluded: BTreeSet<String>,
        /// Exclusive lower bound
        greater_than: Option<i64>,
        /// Exclusive upper bound
        less_than: Option<i64>,
    },
    /// The key must not appear at all (DoesNotExist)
    Absent,
}

/// Feasible label values for a single key under all posted constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    key: String,
    values: ValueSet,
}

impl Requirement {
    /// Require the key to take one of a finite set of values
    pub fn within(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::Only(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Require the key to take any value outside a finite set
    pub fn without(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::AnyExcept {
                excluded: values.into_iter().map(Into::into).collect(),
                greater_than: None,
                less_than: None,
            },
        }
    }

    /// Require the key to exist with any value
    pub fn exists(key: impl Into<String>) -> Self {
        Self::without(key, Vec::<String>::new())
    }

    /// Require the key to be absent
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::Absent,
        }
    }

    /// Require the key's numeric value to exceed `bound`
    pub fn greater_than(key: impl Into<String>, bound: i64) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::AnyExcept {
                excluded: BTreeSet::new(),
                greater_than: Some(bound),
                less_than: None,
            },
        }
    }

    /// Require the key's numeric value to be below `bound`
    pub fn less_than(key: impl Into<String>, bound: i64) -> Self {
        Self {
            key: key.into(),
            values: ValueSet::AnyExcept {
                excluded: BTreeSet::new(),
                greater_than: None,
                less_than: Some(bound),
            },
        }
    }

    /// Translate a posted constraint expression into a requirement
    pub fn from_expression(expr: &ConstraintExpression) -> Result<Self> {
        match expr.operator {
            ExpressionOperator::In => Ok(Self::within(&expr.key, expr.values.clone())),
            ExpressionOperator::NotIn => Ok(Self::without(&expr.key, expr.values.clone())),
            ExpressionOperator::Exists => Ok(Self::exists(&expr.key)),
            ExpressionOperator::DoesNotExist => Ok(Self::absent(&expr.key)),
            ExpressionOperator::Gt => Ok(Self::greater_than(&expr.key, parse_bound(expr)?)),
            ExpressionOperator::Lt => Ok(Self::less_than(&expr.key, parse_bound(expr)?)),
        }
    }

    /// The label key this requirement constrains
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The feasible value set
    pub fn value_set(&self) -> &ValueSet {
        &self.values
    }

    /// Enumerate concrete members; defined only for a finite set
    pub fn values(&self) -> Option<&BTreeSet<String>> {
        match &self.values {
            ValueSet::Only(values) => Some(values),
            _ => None,
        }
    }

    /// Whether a concrete value satisfies this requirement
    pub fn has(&self, value: &str) -> bool {
        match &self.values {
            ValueSet::Only(values) => values.contains(value),
            ValueSet::AnyExcept {
                excluded,
                greater_than,
                less_than,
            } => !excluded.contains(value) && within_bounds(value, *greater_than, *less_than),
            ValueSet::Absent => false,
        }
    }

    /// Whether no value can satisfy this requirement
    pub fn is_empty(&self) -> bool {
        match &self.values {
            ValueSet::Only(values) => values.is_empty(),
            ValueSet::AnyExcept {
                greater_than: Some(g),
                less_than: Some(l),
                ..
            } => g + 1 >= *l,
            _ => false,
        }
    }

    /// Intersect two requirements on the same key
    ///
    /// Fails with `IncompatibleRequirements` when the intersection is empty.
    pub fn intersect(&self, other: &Requirement) -> Result<Requirement> {
        debug_assert_eq!(self.key, other.key);
        let values = match (&self.values, &other.values) {
            (ValueSet::Absent, ValueSet::Absent) => ValueSet::Absent,
            (ValueSet::Absent, _) | (_, ValueSet::Absent) => {
                return Err(SkyliftError::incompatible(&self.key));
            }
            (ValueSet::Only(a), ValueSet::Only(b)) => {
                ValueSet::Only(a.intersection(b).cloned().collect())
            }
            (ValueSet::Only(members), ValueSet::AnyExcept { excluded, greater_than, less_than })
            | (ValueSet::AnyExcept { excluded, greater_than, less_than }, ValueSet::Only(members)) => {
                ValueSet::Only(
                    members
                        .iter()
                        .filter(|v| !excluded.contains(*v) && within_bounds(v, *greater_than, *less_than))
                        .cloned()
                        .collect(),
                )
            }
            (
                ValueSet::AnyExcept { excluded: a, greater_than: ag, less_than: al },
                ValueSet::AnyExcept { excluded: b, greater_than: bg, less_than: bl },
            ) => ValueSet::AnyExcept {
                excluded: a.union(b).cloned().collect(),
                greater_than: max_option(*ag, *bg),
                less_than: min_option(*al, *bl),
            },
        };
        let result = Requirement {
            key: self.key.clone(),
            values,
        };
        if result.is_empty() {
            return Err(SkyliftError::incompatible(&self.key));
        }
        Ok(result)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.values {
            ValueSet::Only(values) => {
                let list: Vec<&str> = values.iter().map(String::as_str).collect();
                write!(f, "{} In [{}]", self.key, list.join(", "))
            }
            ValueSet::AnyExcept {
                excluded,
                greater_than,
                less_than,
            } => {
                if excluded.is_empty() && greater_than.is_none() && less_than.is_none() {
                    return write!(f, "{} Exists", self.key);
                }
                let mut parts = Vec::new();
                if !excluded.is_empty() {
                    let list: Vec<&str> = excluded.iter().map(String::as_str).collect();
                    parts.push(format!("NotIn [{}]", list.join(", ")));
                }
                if let Some(g) = greater_than {
                    parts.push(format!("> {}", g));
                }
                if let Some(l) = less_than {
                    parts.push(format!("< {}", l));
                }
                write!(f, "{} {}", self.key, parts.join(" "))
            }
            ValueSet::Absent => write!(f, "{} DoesNotExist", self.key),
        }
    }
}

fn parse_bound(expr: &ConstraintExpression) -> Result<i64> {
    expr.values
        .first()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| {
            SkyliftError::config(format!(
                "operator {:?} on key {:?} requires a single numeric value",
                expr.operator, expr.key
            ))
        })
}

fn within_bounds(value: &str, greater_than: Option<i64>, less_than: Option<i64>) -> bool {
    if greater_than.is_none() && less_than.is_none() {
        return true;
    }
    let Ok(parsed) = value.parse::<i64>() else {
        return false;
    };
    greater_than.map(|g| parsed > g).unwrap_or(true) && less_than.map(|l| parsed < l).unwrap_or(true)
}

fn max_option(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_option(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// An intersectable set of requirements keyed by label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    /// Create an empty requirement set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a requirement set from concrete labels (one `In` per label)
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut requirements = Self::new();
        for (key, value) in labels {
            requirements.set(Requirement::within(key.clone(), [value.clone()]));
        }
        requirements
    }

    /// Build a requirement set from posted constraint expressions
    pub fn from_expressions<'a>(
        expressions: impl IntoIterator<Item = &'a ConstraintExpression>,
    ) -> Result<Self> {
        let mut requirements = Self::new();
        for expr in expressions {
            requirements.add(Requirement::from_expression(expr)?)?;
        }
        Ok(requirements)
    }

    /// Intersect a requirement into the set in place
    ///
    /// Reports the failing key when any intersection is empty.
    pub fn add(&mut self, requirement: Requirement) -> Result<()> {
        if requirement.is_empty() {
            return Err(SkyliftError::incompatible(requirement.key()));
        }
        let combined = match self.0.get(requirement.key()) {
            Some(existing) => existing.intersect(&requirement)?,
            None => requirement,
        };
        self.0.insert(combined.key().to_string(), combined);
        Ok(())
    }

    /// Intersect every requirement of another set into this one
    pub fn add_all(&mut self, other: &Requirements) -> Result<()> {
        for requirement in other.0.values() {
            self.add(requirement.clone())?;
        }
        Ok(())
    }

    /// Check that every shared key has a nonempty intersection, without mutating
    pub fn compatible(&self, other: &Requirements) -> Result<()> {
        for (key, requirement) in &other.0 {
            if let Some(existing) = self.0.get(key) {
                existing.intersect(requirement)?;
            }
        }
        Ok(())
    }

    /// Replace the requirement for a key without intersecting
    pub fn set(&mut self, requirement: Requirement) {
        self.0.insert(requirement.key().to_string(), requirement);
    }

    /// Drop the requirement for a key
    pub fn remove(&mut self, key: &str) -> Option<Requirement> {
        self.0.remove(key)
    }

    /// Whether a key is constrained
    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The requirement for a key, if constrained
    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    /// Finite members for a key, if the key is finitely constrained
    pub fn values(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key).and_then(Requirement::values)
    }

    /// Iterate over constrained keys in order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over requirements in key order
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    /// Number of constrained keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no key is constrained
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.values().map(|r| r.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_intersection() {
        let a = Requirement::within("zone", ["z1", "z2"]);
        let b = Requirement::within("zone", ["z2", "z3"]);
        let combined = a.intersect(&b).unwrap();
        assert_eq!(combined.values().unwrap().len(), 1);
        assert!(combined.has("z2"));
    }

    #[test]
    fn test_empty_intersection_reports_key() {
        let a = Requirement::within("zone", ["z1"]);
        let b = Requirement::within("zone", ["z2"]);
        assert_eq!(
            a.intersect(&b).unwrap_err(),
            SkyliftError::incompatible("zone")
        );
    }

    #[test]
    fn test_finite_meets_cofinite() {
        let a = Requirement::within("zone", ["z1", "z2", "z3"]);
        let b = Requirement::without("zone", ["z2"]);
        let combined = a.intersect(&b).unwrap();
        assert!(combined.has("z1"));
        assert!(!combined.has("z2"));
        assert!(combined.has("z3"));
    }

    #[test]
    fn test_cofinite_stays_cofinite() {
        let a = Requirement::without("zone", ["z1"]);
        let b = Requirement::without("zone", ["z2"]);
        let combined = a.intersect(&b).unwrap();
        // still cofinite: members are not enumerable
        assert!(combined.values().is_none());
        assert!(!combined.has("z1"));
        assert!(!combined.has("z2"));
        assert!(combined.has("z3"));
    }

    #[test]
    fn test_numeric_bounds() {
        let gt = Requirement::greater_than("instance-generation", 3);
        assert!(gt.has("4"));
        assert!(!gt.has("3"));
        assert!(!gt.has("large")); // non-numeric values never satisfy a bound

        let window = gt
            .intersect(&Requirement::less_than("instance-generation", 6))
            .unwrap();
        assert!(window.has("5"));
        assert!(!window.has("6"));

        // Gt 3 and Lt 4 admits no integer
        let gt = Requirement::greater_than("instance-generation", 3);
        let lt = Requirement::less_than("instance-generation", 4);
        assert!(gt.intersect(&lt).is_err());
    }

    #[test]
    fn test_bounds_filter_finite_members() {
        let finite = Requirement::within("instance-generation", ["2", "5", "arm"]);
        let combined = finite
            .intersect(&Requirement::greater_than("instance-generation", 3))
            .unwrap();
        assert_eq!(combined.values().unwrap().len(), 1);
        assert!(combined.has("5"));
    }

    #[test]
    fn test_absent_conflicts_with_presence() {
        let absent = Requirement::absent("gpu");
        assert!(absent.intersect(&Requirement::within("gpu", ["true"])).is_err());
        assert!(absent.intersect(&Requirement::exists("gpu")).is_err());
        assert!(absent.intersect(&Requirement::absent("gpu")).is_ok());
        assert!(!absent.has("true"));
    }

    #[test]
    fn test_requirements_add_and_compatible() {
        let mut node = Requirements::new();
        node.add(Requirement::within("zone", ["z1", "z2"])).unwrap();

        let mut workload = Requirements::new();
        workload.add(Requirement::within("zone", ["z2"])).unwrap();
        workload.add(Requirement::within("arch", ["arm64"])).unwrap();

        // compatible only inspects shared keys
        node.compatible(&workload).unwrap();
        node.add_all(&workload).unwrap();
        assert_eq!(node.values("zone").unwrap().len(), 1);
        assert!(node.has("arch"));

        let mut conflicting = Requirements::new();
        conflicting.add(Requirement::within("zone", ["z3"])).unwrap();
        assert!(node.compatible(&conflicting).is_err());
    }

    #[test]
    fn test_from_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("zone".to_string(), "z1".to_string());
        labels.insert("arch".to_string(), "amd64".to_string());

        let requirements = Requirements::from_labels(&labels);
        assert!(requirements.get("zone").unwrap().has("z1"));
        assert!(!requirements.get("arch").unwrap().has("arm64"));
    }

    #[test]
    fn test_expression_round_trip() {
        let expr = ConstraintExpression::new("tier", ExpressionOperator::Gt, vec!["5".to_string()]);
        let requirement = Requirement::from_expression(&expr).unwrap();
        assert!(requirement.has("6"));

        let bad = ConstraintExpression::new("tier", ExpressionOperator::Gt, vec!["high".to_string()]);
        assert!(Requirement::from_expression(&bad).is_err());
    }

    #[test]
    fn test_expression_evaluate() {
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "frontend".to_string());
        labels.insert("priority".to_string(), "10".to_string());

        assert!(ConstraintExpression::within("tier", ["frontend", "backend"]).evaluate(&labels));
        assert!(!ConstraintExpression::without("tier", ["frontend"]).evaluate(&labels));
        assert!(
            ConstraintExpression::new("priority", ExpressionOperator::Gt, vec!["5".to_string()])
                .evaluate(&labels)
        );
        assert!(ConstraintExpression::new("missing", ExpressionOperator::DoesNotExist, vec![])
            .evaluate(&labels));
    }
}
