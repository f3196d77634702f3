//! Per-record registry of written query fragments.
//!
//! Maps each record identifier to the composite hashes of the fragments
//! that have been written against it. Consulted only by the diff engine
//! (to skip already-tracked fetch boundaries) and by GC eviction; never
//! used for data values.

use std::collections::{HashMap, HashSet};

use crate::store::record::RecordId;

#[derive(Debug, Default)]
pub struct QueryTracker {
    tracked: HashMap<RecordId, HashSet<u128>>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: &str, composite_hash: u128) {
        self.tracked
            .entry(id.to_string())
            .or_default()
            .insert(composite_hash);
    }

    pub fn is_tracked(&self, id: &str, composite_hash: u128) -> bool {
        self.tracked
            .get(id)
            .map(|hashes| hashes.contains(&composite_hash))
            .unwrap_or(false)
    }

    /// Drop all tracking for an evicted record.
    pub fn untrack(&mut self, id: &str) {
        self.tracked.remove(id);
    }
}
