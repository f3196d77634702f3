//! Garbage collection.
//!
//! Mark-and-sweep over registered record identifiers. Roots are the store's
//! root-call index entries plus any extra roots the caller pins (pending
//! transactions' optimistic records); marking follows every link kind the
//! store knows about. The sweep returns the unreachable set; the engine
//! performs the actual eviction so tracker and registry stay consistent.
//!
//! Collection only ever runs between turns, so no traversal can observe a
//! half-collected store.

use std::collections::HashSet;

use crate::store::record::RecordId;
use crate::store::RecordStore;

#[derive(Debug, Default)]
pub struct GarbageCollector {
    registered: HashSet<RecordId>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an identifier eligible for collection accounting.
    pub fn register(&mut self, id: &str) {
        self.registered.insert(id.to_string());
    }

    pub fn unregister(&mut self, id: &str) {
        self.registered.remove(id);
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    /// Mark-and-sweep. Returns the registered identifiers unreachable from
    /// the root set; the caller evicts them.
    pub fn collect(
        &self,
        store: &RecordStore,
        extra_roots: &HashSet<RecordId>,
    ) -> HashSet<RecordId> {
        let mut marked: HashSet<RecordId> = HashSet::new();
        let mut frontier: Vec<RecordId> = store
            .root_ids()
            .into_iter()
            .chain(extra_roots.iter().cloned())
            .collect();

        while let Some(id) = frontier.pop() {
            if !marked.insert(id.clone()) {
                continue;
            }
            for link in store.links_of(&id) {
                if !marked.contains(&link) {
                    frontier.push(link);
                }
            }
        }

        let swept: HashSet<RecordId> = self
            .registered
            .iter()
            .filter(|id| !marked.contains(*id))
            .cloned()
            .collect();
        tracing::debug!(
            registered = self.registered.len(),
            marked = marked.len(),
            swept = swept.len(),
            "garbage collection pass"
        );
        swept
    }
}

// ── Tests ──────────────────────────────────────────────────────────
