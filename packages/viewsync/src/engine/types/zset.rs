use super::row::RowId;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub type Weight = i64;
pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<K> = std::collections::HashSet<K, BuildHasherDefault<FxHasher>>;

/// Multiplicity of each output row identity.
pub type ZSet = FastMap<RowId, Weight>;

/// Represents a weight transition for delta computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightTransition {
    /// Row newly appears (old_weight <= 0, new_weight > 0)
    Inserted,
    /// Row's multiplicity changed but it stays present
    Retained,
    /// Row removed entirely (old_weight > 0, new_weight <= 0)
    Deleted,
    Unchanged,
}

impl WeightTransition {
    pub fn compute(old_weight: Weight, new_weight: Weight) -> Self {
        match (old_weight > 0, new_weight > 0) {
            (false, true) => WeightTransition::Inserted,
            (true, false) => WeightTransition::Deleted,
            (true, true) if new_weight != old_weight => WeightTransition::Retained,
            _ => WeightTransition::Unchanged,
        }
    }

    /// Only presence changes matter for query membership.
    pub fn is_membership_change(&self) -> bool {
        matches!(self, WeightTransition::Inserted | WeightTransition::Deleted)
    }
}

/// ZSet operations following DBSP semantics
pub trait ZSetOps {
    /// Add one weighted change, dropping entries that reach zero.
    fn add_weight(&mut self, key: &RowId, weight: Weight);

    /// Check if row is present (weight > 0)
    fn is_present(&self, key: &RowId) -> bool;
}

impl ZSetOps for ZSet {
    fn add_weight(&mut self, key: &RowId, weight: Weight) {
        if weight == 0 {
            return;
        }
        let entry = self.entry(key.clone()).or_insert(0);
        *entry += weight;
        if *entry == 0 {
            self.remove(key);
        }
    }

    fn is_present(&self, key: &RowId) -> bool {
        self.get(key).map(|&w| w > 0).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Datum, RowKey};

    fn id(n: i64) -> RowId {
        let mut key = RowKey::new();
        key.push("id", Datum::from(n));
        RowId::new("t", key)
    }

    #[test]
    fn test_weight_transitions() {
        assert_eq!(WeightTransition::compute(0, 1), WeightTransition::Inserted);
        assert_eq!(WeightTransition::compute(1, 0), WeightTransition::Deleted);
        assert_eq!(WeightTransition::compute(1, 2), WeightTransition::Retained);
        assert_eq!(WeightTransition::compute(2, 2), WeightTransition::Unchanged);
        assert_eq!(WeightTransition::compute(-1, 0), WeightTransition::Unchanged);
        assert!(WeightTransition::Inserted.is_membership_change());
        assert!(!WeightTransition::Retained.is_membership_change());
    }

    #[test]
    fn test_add_weight_cleans_zero() {
        let mut zset = ZSet::default();
        zset.add_weight(&id(1), 1);
        assert!(zset.is_present(&id(1)));
        zset.add_weight(&id(1), -1);
        assert!(zset.is_empty());
        zset.add_weight(&id(2), -1);
        assert!(!zset.is_present(&id(2)));
    }
}
