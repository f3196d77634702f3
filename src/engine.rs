//! The cache engine.
//!
//! `CacheEngine` is the single owning handle over the record store, query
//! tracker, deferred-fragment tracker, garbage collector, change emitter,
//! mutation queue and task queue. Callers hold an engine instance; there is
//! no process-global cache.
//!
//! The engine is single-threaded and turn-based: every public operation
//! runs to completion, queueing cross-turn work (broadcasts, GC) on the
//! task queue, which `run_until_idle` drains at the turn boundary.

use std::collections::HashSet;

use serde_json::Value;

use crate::config::CacheConfig;
use crate::deferred::{DeferredEvent, DeferredFragmentTracker, DeferredKey, ListenerId, Resolution};
use crate::diff;
use crate::emitter::{ChangeEmitter, SubscriptionId};
use crate::error::Result;
use crate::gc::GarbageCollector;
use crate::mutation::{
    CommitAction, CommitDispatcher, ErrorRecovery, FailureOutcome, MutationQueue, MutationRequest,
    OptimisticUpdate, TransactionId, TransactionStatus,
};
use crate::query::{RootSelection, Selection};
use crate::reader::{self, ReadResult};
use crate::sched::{Task, TaskQueue};
use crate::store::record::RecordId;
use crate::store::{disk, RecordStore, TierKind};
use crate::tracker::QueryTracker;
use crate::writer::{ChangeSet, NormalizerWriter};

pub struct CacheEngine {
    config: CacheConfig,
    store: RecordStore,
    tracker: QueryTracker,
    deferred: DeferredFragmentTracker,
    gc: GarbageCollector,
    emitter: ChangeEmitter,
    mutations: MutationQueue,
    tasks: TaskQueue,
}

impl CacheEngine {
    /// Open an engine. When the config names a snapshot path and a file
    /// exists there, the cached tier is seeded from it.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let mut engine = Self {
            config,
            store: RecordStore::new(),
            tracker: QueryTracker::new(),
            deferred: DeferredFragmentTracker::new(),
            gc: GarbageCollector::new(),
            emitter: ChangeEmitter::new(),
            mutations: MutationQueue::new(),
            tasks: TaskQueue::new(),
        };
        if let Some(path) = engine.config.snapshot_path.clone() {
            if path.exists() {
                engine.store.hydrate_cached(disk::load(&path)?);
            }
        }
        Ok(engine)
    }

    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            store: RecordStore::new(),
            tracker: QueryTracker::new(),
            deferred: DeferredFragmentTracker::new(),
            gc: GarbageCollector::new(),
            emitter: ChangeEmitter::new(),
            mutations: MutationQueue::new(),
            tasks: TaskQueue::new(),
        }
    }

    // ── Writing ────────────────────────────────────────────────────

    /// Write a confirmed server response into the base tier.
    pub fn write_query(&mut self, root: &RootSelection, payload: &Value) -> Result<ChangeSet> {
        self.write_tier(TierKind::Base, root, payload)
    }

    /// Write an optimistic payload into the queued overlay, outside of any
    /// transaction. Cleared with the rest of the overlay on rebuild.
    pub fn write_optimistic(&mut self, root: &RootSelection, payload: &Value) -> Result<ChangeSet> {
        self.write_tier(TierKind::Queued, root, payload)
    }

    /// Write a payload to the tier its `extensions.isOptimistic` flag
    /// selects; absent or non-boolean means confirmed.
    pub fn write_payload(&mut self, root: &RootSelection, payload: &Value) -> Result<ChangeSet> {
        let optimistic = payload
            .get("extensions")
            .and_then(|e| e.get("isOptimistic"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let tier = if optimistic {
            TierKind::Queued
        } else {
            TierKind::Base
        };
        self.write_tier(tier, root, payload)
    }

    fn write_tier(
        &mut self,
        tier: TierKind,
        root: &RootSelection,
        payload: &Value,
    ) -> Result<ChangeSet> {
        let change = NormalizerWriter::new(&mut self.store, &mut self.tracker, tier)
            .write_root(root, payload)?;
        self.absorb_change(&change);

        // A freshly resolved root call migrates its deferred fragments.
        let root_key = root.root_call_key();
        if let Some(id) = self.store.root_record_id(&root_key) {
            self.deferred.resolve_root(&root_key, &id);
        }
        Ok(change)
    }

    fn absorb_change(&mut self, change: &ChangeSet) {
        for id in &change.created {
            self.gc.register(id);
        }
        if !change.updated.is_empty() {
            self.emitter.stage(change.updated.iter().cloned());
            self.tasks.schedule(Task::BroadcastChanges);
        }
    }

    // ── Reading and diffing ────────────────────────────────────────

    pub fn lookup(&self, root: &RootSelection) -> ReadResult {
        reader::lookup_root(&self.store, root)
    }

    pub fn lookup_record(&self, id: &str, selections: &[Selection]) -> ReadResult {
        reader::lookup(&self.store, id, selections)
    }

    /// Minimal follow-up query, or `None` when the cache satisfies `root`.
    pub fn diff(&self, root: &RootSelection) -> Option<RootSelection> {
        diff::diff_root(&self.store, &self.tracker, root)
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Read a query and watch every record the read touched. The callback
    /// fires at turn boundaries with the changed watched identifiers.
    pub fn subscribe(
        &mut self,
        root: &RootSelection,
        callback: impl FnMut(&[RecordId]) + 'static,
    ) -> (SubscriptionId, ReadResult) {
        let result = self.lookup(root);
        let id = self.emitter.subscribe(result.seen_ids.clone(), callback);
        (id, result)
    }

    /// Re-read a subscription's query and replace its watch set with the
    /// records the fresh read observed.
    pub fn update_watch(&mut self, id: SubscriptionId, root: &RootSelection) -> ReadResult {
        let result = self.lookup(root);
        self.emitter.update_watch(id, result.seen_ids.clone());
        result
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create a transaction. Its optimistic payload, if any, is applied to
    /// the queued overlay immediately.
    pub fn create_transaction(
        &mut self,
        request: MutationRequest,
        optimistic: Option<OptimisticUpdate>,
        collision_key: Option<String>,
    ) -> Result<TransactionId> {
        if let Some(update) = &optimistic {
            let change =
                NormalizerWriter::new(&mut self.store, &mut self.tracker, TierKind::Queued)
                    .write_root(&update.root, &update.payload)?;
            self.absorb_change(&change);
        }
        Ok(self.mutations.create(request, optimistic, collision_key))
    }

    /// Ask the transaction to commit. Dispatches through `dispatcher` when
    /// it is the head of its collision queue; otherwise it waits.
    pub fn commit_transaction(
        &mut self,
        id: TransactionId,
        dispatcher: &mut dyn CommitDispatcher,
    ) -> Result<CommitAction> {
        let action = self.mutations.begin_commit(id)?;
        if action == CommitAction::Dispatch {
            let request = self.mutations.request(id)?.clone();
            dispatcher.dispatch(id, &request);
        }
        Ok(action)
    }

    /// Server acknowledged the commit. The response payload lands in the
    /// base tier, the transaction's optimistic payload leaves the overlay,
    /// and the next queued transaction on the collision key is dispatched.
    pub fn commit_succeeded(
        &mut self,
        id: TransactionId,
        response: &Value,
        dispatcher: &mut dyn CommitDispatcher,
    ) -> Result<()> {
        let query = self.mutations.request(id)?.query.clone();
        let next = self.mutations.mark_committed(id)?;

        let change = NormalizerWriter::new(&mut self.store, &mut self.tracker, TierKind::Base)
            .write_root(&query, response)?;
        self.absorb_change(&change);
        self.rebuild_queued()?;

        if let Some(next_id) = next {
            let request = self.mutations.request(next_id)?.clone();
            dispatcher.dispatch(next_id, &request);
        }
        Ok(())
    }

    /// Server rejected the commit. Queued followers on the same collision
    /// key are force-failed without dispatch; the overlay is rebuilt from
    /// the transactions still pending.
    pub fn commit_failed(
        &mut self,
        id: TransactionId,
        recovery: ErrorRecovery,
    ) -> Result<FailureOutcome> {
        let outcome = self.mutations.mark_failed(id, recovery)?;
        self.rebuild_queued()?;
        Ok(outcome)
    }

    /// Withdraw a transaction that is not in flight.
    pub fn rollback_transaction(&mut self, id: TransactionId) -> Result<()> {
        self.mutations.rollback(id)?;
        self.rebuild_queued()
    }

    pub fn transaction_status(&self, id: TransactionId) -> Result<TransactionStatus> {
        self.mutations.status(id)
    }

    /// Rebuild the queued overlay from scratch: clear it, then replay every
    /// pending transaction's optimistic payload in creation order. Exact
    /// rollback without incremental undo bookkeeping.
    fn rebuild_queued(&mut self) -> Result<()> {
        let cleared = self.store.clear_queued();
        if !cleared.is_empty() {
            self.emitter.stage(cleared);
            self.tasks.schedule(Task::BroadcastChanges);
        }

        let updates: Vec<OptimisticUpdate> = self
            .mutations
            .optimistic_updates()
            .into_iter()
            .cloned()
            .collect();
        for update in &updates {
            let change =
                NormalizerWriter::new(&mut self.store, &mut self.tracker, TierKind::Queued)
                    .write_root(&update.root, &update.payload)?;
            self.absorb_change(&change);
        }
        tracing::debug!(replayed = updates.len(), "queued tier rebuilt");

        if self.config.auto_gc {
            self.tasks.schedule(Task::CollectGarbage);
        }
        Ok(())
    }

    // ── Deferred fragments ─────────────────────────────────────────

    pub fn register_deferred(&mut self, key: DeferredKey, fragment_hash: u128) {
        self.deferred.register(key, fragment_hash);
    }

    /// Write a deferred fragment's payload and mark it resolved.
    pub fn deferred_succeeded(
        &mut self,
        key: DeferredKey,
        fragment_hash: u128,
        root: &RootSelection,
        payload: &Value,
    ) -> Result<()> {
        self.write_query(root, payload)?;
        self.deferred.resolve(key, fragment_hash, Resolution::Succeeded);
        self.tasks.schedule(Task::BroadcastDeferred);
        Ok(())
    }

    pub fn deferred_failed(&mut self, key: DeferredKey, fragment_hash: u128, reason: &str) {
        self.deferred
            .resolve(key, fragment_hash, Resolution::Failed(reason.to_string()));
        self.tasks.schedule(Task::BroadcastDeferred);
    }

    /// Fail every deferred fragment still outstanding on a record, as when
    /// the request carrying them dies in transport.
    pub fn deferred_request_failed(&mut self, id: &str, reason: &str) {
        self.deferred.fail_all(id, reason);
        self.tasks.schedule(Task::BroadcastDeferred);
    }

    pub fn has_outstanding_deferred(&self, id: &str) -> bool {
        self.deferred.has_outstanding(id)
    }

    pub fn listen_deferred(
        &mut self,
        listener: impl FnMut(&[DeferredEvent]) + 'static,
    ) -> ListenerId {
        self.deferred.listen(listener)
    }

    pub fn unlisten_deferred(&mut self, id: ListenerId) -> bool {
        self.deferred.unlisten(id)
    }

    // ── Garbage collection ─────────────────────────────────────────

    /// Run a collection pass now. Records reachable from root calls or
    /// from the optimistic overlay survive; everything else registered is
    /// evicted from the mutable tiers. Returns the eviction count.
    pub fn collect_garbage(&mut self) -> usize {
        let pinned: HashSet<RecordId> = self.store.queued_record_ids().into_iter().collect();
        let swept = self.gc.collect(&self.store, &pinned);
        self.store.evict(&swept);
        for id in &swept {
            self.tracker.untrack(id);
            self.gc.unregister(id);
        }
        tracing::debug!(
            swept = swept.len(),
            registered = self.gc.registered_count(),
            "collection pass finished"
        );
        swept.len()
    }

    // ── Turn boundary ──────────────────────────────────────────────

    /// Drain the task queue: flush broadcasts and run scheduled GC. Call
    /// after one or more operations to deliver their effects.
    pub fn run_until_idle(&mut self) {
        while let Some(task) = self.tasks.next() {
            match task {
                Task::BroadcastChanges => self.emitter.flush(),
                Task::BroadcastDeferred => self.deferred.broadcast(),
                Task::CollectGarbage => {
                    self.collect_garbage();
                }
            }
        }
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Seed the cached tier from the configured snapshot file.
    pub fn hydrate_snapshot(&mut self) -> Result<()> {
        if let Some(path) = self.config.snapshot_path.clone() {
            self.store.hydrate_cached(disk::load(&path)?);
        }
        Ok(())
    }

    /// Persist the confirmed base tier to the configured snapshot file.
    /// A no-op without a configured path.
    pub fn persist_snapshot(&self) -> Result<()> {
        if let Some(path) = &self.config.snapshot_path {
            disk::save(path, &self.store.export_base())?;
        }
        Ok(())
    }
}

impl Default for CacheEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
