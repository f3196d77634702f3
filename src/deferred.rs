//! Deferred fragment tracking.
//!
//! Deferred fragments arrive in follow-up payloads after the main query
//! resolves. This tracker remembers which fragments are still outstanding,
//! keyed either by record identifier or (before the record's identifier is
//! known) by root-call key, and batches resolution events for broadcast at
//! the next turn boundary.

use std::collections::{HashMap, HashSet};

use crate::store::record::RecordId;

/// Where an outstanding fragment is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeferredKey {
    Record(RecordId),
    RootCall(String),
}

/// How a deferred fragment resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Failed(String),
}

/// One batched resolution event.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEvent {
    pub key: DeferredKey,
    pub fragment_hash: u128,
    pub resolution: Resolution,
}

pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&[DeferredEvent])>;

#[derive(Default)]
pub struct DeferredFragmentTracker {
    by_id: HashMap<RecordId, HashSet<u128>>,
    by_root: HashMap<String, HashSet<u128>>,
    pending_events: Vec<DeferredEvent>,
    listeners: HashMap<ListenerId, Listener>,
    next_listener: ListenerId,
}

impl DeferredFragmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment as outstanding.
    pub fn register(&mut self, key: DeferredKey, fragment_hash: u128) {
        match key {
            DeferredKey::Record(id) => {
                self.by_id.entry(id).or_default().insert(fragment_hash);
            }
            DeferredKey::RootCall(root) => {
                self.by_root.entry(root).or_default().insert(fragment_hash);
            }
        }
    }

    /// Move root-call-keyed fragments under the record identifier the root
    /// call resolved to.
    pub fn resolve_root(&mut self, root_call_key: &str, id: &str) {
        if let Some(hashes) = self.by_root.remove(root_call_key) {
            tracing::debug!(
                root = %root_call_key,
                id = %id,
                fragments = hashes.len(),
                "deferred fragments migrated to resolved identifier"
            );
            self.by_id.entry(id.to_string()).or_default().extend(hashes);
        }
    }

    pub fn is_outstanding(&self, key: &DeferredKey, fragment_hash: u128) -> bool {
        let hashes = match key {
            DeferredKey::Record(id) => self.by_id.get(id),
            DeferredKey::RootCall(root) => self.by_root.get(root),
        };
        hashes.map(|h| h.contains(&fragment_hash)).unwrap_or(false)
    }

    /// Whether any fragment is still outstanding for this record.
    pub fn has_outstanding(&self, id: &str) -> bool {
        self.by_id
            .get(id)
            .map(|h| !h.is_empty())
            .unwrap_or(false)
    }

    /// Mark a fragment resolved and stage the event for the next broadcast.
    /// Resolving a fragment that was never outstanding is logged, not an
    /// error: a duplicate payload can race its own registration.
    pub fn resolve(&mut self, key: DeferredKey, fragment_hash: u128, resolution: Resolution) {
        let removed = match &key {
            DeferredKey::Record(id) => remove_hash(&mut self.by_id, id, fragment_hash),
            DeferredKey::RootCall(root) => remove_hash(&mut self.by_root, root, fragment_hash),
        };
        if !removed {
            tracing::warn!(key = ?key, "resolution for fragment not outstanding");
        }
        self.pending_events.push(DeferredEvent {
            key,
            fragment_hash,
            resolution,
        });
    }

    /// Fail every outstanding fragment of one record at once, as when the
    /// request carrying them dies.
    pub fn fail_all(&mut self, id: &str, reason: &str) {
        let Some(hashes) = self.by_id.remove(id) else {
            return;
        };
        for fragment_hash in hashes {
            self.pending_events.push(DeferredEvent {
                key: DeferredKey::Record(id.to_string()),
                fragment_hash,
                resolution: Resolution::Failed(reason.to_string()),
            });
        }
    }

    pub fn listen(&mut self, listener: impl FnMut(&[DeferredEvent]) + 'static) -> ListenerId {
        self.next_listener += 1;
        self.listeners.insert(self.next_listener, Box::new(listener));
        self.next_listener
    }

    pub fn unlisten(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending_events.is_empty()
    }

    /// Deliver all staged resolution events to every listener.
    pub fn broadcast(&mut self) {
        if self.pending_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending_events);
        for listener in self.listeners.values_mut() {
            listener(&events);
        }
        tracing::debug!(events = events.len(), "deferred broadcast flushed");
    }
}

fn remove_hash(map: &mut HashMap<String, HashSet<u128>>, key: &str, hash: u128) -> bool {
    match map.get_mut(key) {
        Some(hashes) => {
            let removed = hashes.remove(&hash);
            if hashes.is_empty() {
                map.remove(key);
            }
            removed
        }
        None => false,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
