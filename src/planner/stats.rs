//! Cardinality statistics for planner scoring and index tie-breaks.

use crate::storage::Snapshot;
use crate::value::Keyword;
use std::collections::HashMap;

/// Default entity-count estimate when the store reports nothing.
pub const DEFAULT_ENTITY_COUNT: u64 = 1_000_000;

/// Default per-attribute datom-count estimate.
pub const DEFAULT_ATTRIBUTE_CARDINALITY: u64 = 1000;

/// Per-attribute cardinality estimates plus the total entity count.
///
/// Estimates feed the phase continuation score and matcher index
/// tie-breaks; absent attributes fall back to the defaults, so a missing
/// statistics pass degrades plans but never correctness.
#[derive(Debug, Clone)]
pub struct Statistics {
    pub entity_count: u64,
    pub attribute_cardinality: HashMap<Keyword, u64>,
}

impl Statistics {
    /// All-defaults statistics.
    pub fn default_estimates() -> Self {
        Statistics {
            entity_count: DEFAULT_ENTITY_COUNT,
            attribute_cardinality: HashMap::new(),
        }
    }

    /// Pull counts for the given attributes out of a snapshot.
    pub fn analyze(snapshot: &dyn Snapshot, attributes: &[Keyword]) -> Self {
        let mut attribute_cardinality = HashMap::with_capacity(attributes.len());
        for &attr in attributes {
            if let Some(count) = snapshot.attribute_cardinality(attr) {
                attribute_cardinality.insert(attr, count);
            }
        }
        Statistics {
            entity_count: snapshot.entity_count().unwrap_or(DEFAULT_ENTITY_COUNT),
            attribute_cardinality,
        }
    }

    /// Estimated datom count for one attribute.
    pub fn cardinality(&self, attr: Keyword) -> u64 {
        self.attribute_cardinality
            .get(&attr)
            .copied()
            .unwrap_or(DEFAULT_ATTRIBUTE_CARDINALITY)
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics::default_estimates()
    }
}
