//! Resource quantity algebra
//!
//! Resource maps are open-keyed: `cpu` is counted in millicores and `memory`
//! in bytes, any other key is an opaque integer quantity. Quantities are
//! signed because remaining provisioner budgets may legitimately go negative
//! after a pessimistic reservation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known resource name for CPU, in millicores
pub const CPU: &str = "cpu";
/// Well-known resource name for memory, in bytes
pub const MEMORY: &str = "memory";

/// A map of resource name to signed quantity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources(BTreeMap<String, i64>);

impl Resources {
    /// Create an empty resource map
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a quantity for an arbitrary resource name
    pub fn with(mut self, name: impl Into<String>, quantity: i64) -> Self {
        self.0.insert(name.into(), quantity);
        self
    }

    /// Set the CPU quantity (millicores)
    pub fn cpu(self, millis: i64) -> Self {
        self.with(CPU, millis)
    }

    /// Set the memory quantity (bytes)
    pub fn memory(self, bytes: i64) -> Self {
        self.with(MEMORY, bytes)
    }

    /// Get the quantity for a resource, zero if absent
    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Insert or replace a quantity
    pub fn insert(&mut self, name: impl Into<String>, quantity: i64) {
        self.0.insert(name.into(), quantity);
    }

    /// Whether no resource is tracked
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over (name, quantity) pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Elementwise sum of two resource maps
    pub fn add(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        result.add_assign(other);
        result
    }

    /// Add another resource map in place
    pub fn add_assign(&mut self, other: &Resources) {
        for (name, quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += quantity;
        }
    }

    /// Elementwise difference; results may be negative
    pub fn subtract(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            *result.0.entry(name.clone()).or_insert(0) -= quantity;
        }
        result
    }

    /// Elementwise difference floored at zero per key
    pub fn saturating_subtract(&self, other: &Resources) -> Resources {
        let mut result = self.subtract(other);
        for quantity in result.0.values_mut() {
            if *quantity < 0 {
                *quantity = 0;
            }
        }
        result
    }

    /// Elementwise maximum over the union of keys
    pub fn max(&self, other: &Resources) -> Resources {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let entry = result.0.entry(name.clone()).or_insert(*quantity);
            *entry = (*entry).max(*quantity);
        }
        result
    }

    /// Whether every requested quantity fits within `capacity`
    ///
    /// A key absent from `capacity` counts as zero capacity.
    pub fn fits(&self, capacity: &Resources) -> bool {
        self.0.iter().all(|(name, quantity)| *quantity <= capacity.get(name))
    }

    /// Whether this map exceeds `budget` on any key tracked by the budget
    pub fn exceeds_any(&self, budget: &Resources) -> bool {
        budget.0.iter().any(|(name, remaining)| self.get(name) > *remaining)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "{{}}");
        }
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

impl FromIterator<(String, i64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_subtract() {
        let a = Resources::new().cpu(1000).memory(2048);
        let b = Resources::new().cpu(500).with("gpu", 1);

        let sum = a.add(&b);
        assert_eq!(sum.get(CPU), 1500);
        assert_eq!(sum.get(MEMORY), 2048);
        assert_eq!(sum.get("gpu"), 1);

        let diff = a.subtract(&b);
        assert_eq!(diff.get(CPU), 500);
        assert_eq!(diff.get("gpu"), -1);
    }

    #[test]
    fn test_subtract_can_go_negative() {
        let remaining = Resources::new().cpu(4000);
        let capacity = Resources::new().cpu(8000);
        assert_eq!(remaining.subtract(&capacity).get(CPU), -4000);
        assert_eq!(remaining.saturating_subtract(&capacity).get(CPU), 0);
    }

    #[test]
    fn test_max_is_elementwise() {
        let a = Resources::new().cpu(2000).memory(1024);
        let b = Resources::new().cpu(1000).memory(4096).with("gpu", 2);

        let max = a.max(&b);
        assert_eq!(max.get(CPU), 2000);
        assert_eq!(max.get(MEMORY), 4096);
        assert_eq!(max.get("gpu"), 2);
    }

    #[test]
    fn test_fits() {
        let requests = Resources::new().cpu(500).memory(1024);
        let capacity = Resources::new().cpu(1000).memory(1024);
        assert!(requests.fits(&capacity));

        let over = Resources::new().cpu(1500);
        assert!(!over.fits(&capacity));

        // a request for a resource the capacity does not advertise never fits
        let gpu = Resources::new().with("gpu", 1);
        assert!(!gpu.fits(&capacity));
    }

    #[test]
    fn test_exceeds_any_only_checks_budget_keys() {
        let budget = Resources::new().cpu(4000);
        let small = Resources::new().cpu(2000).memory(1 << 30);
        let large = Resources::new().cpu(8000);

        assert!(!small.exceeds_any(&budget));
        assert!(large.exceeds_any(&budget));
    }
}
