//! Mutation transactions.
//!
//! The queue is a passive status machine over pending mutations; the engine
//! orchestrates the store effects (optimistic writes, queued-tier rebuilds,
//! broadcasts) around it. Transactions sharing a collision key serialize:
//! only the head of each collision queue is ever handed to the dispatcher,
//! and a failed head force-fails its queued followers without dispatching
//! them.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::error::{CacheError, Result};
use crate::query::RootSelection;

pub type TransactionId = u64;

/// Lifecycle of one transaction.
///
/// `Uncommitted → CommitQueued? → Committing → {Committed, CommitFailed,
/// CollisionCommitFailed}`. `CommitQueued` only occurs behind a collision
/// key; `CollisionCommitFailed` is assigned to queued followers of a failed
/// head, which never reach the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Uncommitted,
    CommitQueued,
    Committing,
    Committed,
    CommitFailed,
    CollisionCommitFailed,
}

impl TransactionStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uncommitted => "uncommitted",
            Self::CommitQueued => "commit_queued",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::CommitFailed => "commit_failed",
            Self::CollisionCommitFailed => "collision_commit_failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::CommitFailed | Self::CollisionCommitFailed
        )
    }
}

/// What to do with a failed transaction's optimistic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorRecovery {
    /// Drop the optimistic payload from the overlay.
    #[default]
    Rollback,
    /// Keep the optimistic payload applied, e.g. pending a retry.
    Retain,
}

/// Transport seam. The engine hands each dispatchable transaction to the
/// dispatcher exactly once; transactions queued behind a collision key are
/// not dispatched until the head resolves.
pub trait CommitDispatcher {
    fn dispatch(&mut self, id: TransactionId, request: &MutationRequest);
}

/// The mutation the transport will send.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    pub query: RootSelection,
    pub variables: Value,
}

/// Optimistic overlay payload applied while the mutation is in flight,
/// written in the same shape as a server response.
#[derive(Debug, Clone)]
pub struct OptimisticUpdate {
    pub root: RootSelection,
    pub payload: Value,
}

/// Decision from starting a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// Head of its collision queue (or no collision key): dispatch now.
    Dispatch,
    /// Behind an in-flight transaction with the same collision key.
    Queued,
}

/// Result of failing a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    /// Whether the failed transaction's optimistic payload was dropped.
    pub rolled_back: bool,
    /// Queued followers force-failed without dispatch, in queue order.
    pub cascade: Vec<TransactionId>,
}

struct Transaction {
    status: TransactionStatus,
    request: MutationRequest,
    optimistic: Option<OptimisticUpdate>,
    collision_key: Option<String>,
}

#[derive(Default)]
pub struct MutationQueue {
    transactions: HashMap<TransactionId, Transaction>,
    /// Creation order; replay of optimistic payloads follows it.
    order: Vec<TransactionId>,
    collision_queues: HashMap<String, VecDeque<TransactionId>>,
    next_id: TransactionId,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        request: MutationRequest,
        optimistic: Option<OptimisticUpdate>,
        collision_key: Option<String>,
    ) -> TransactionId {
        self.next_id += 1;
        let id = self.next_id;
        self.transactions.insert(
            id,
            Transaction {
                status: TransactionStatus::Uncommitted,
                request,
                optimistic,
                collision_key,
            },
        );
        self.order.push(id);
        tracing::debug!(transaction = id, "transaction created");
        id
    }

    pub fn status(&self, id: TransactionId) -> Result<TransactionStatus> {
        self.get(id).map(|t| t.status)
    }

    pub fn request(&self, id: TransactionId) -> Result<&MutationRequest> {
        self.get(id).map(|t| &t.request)
    }

    /// Start committing. The caller dispatches only on `Dispatch`.
    ///
    /// A transaction joins its collision queue here, not at creation: a
    /// transaction that never asks to commit must not block the key, and
    /// rolling it back must not leave a follower waiting on it.
    pub fn begin_commit(&mut self, id: TransactionId) -> Result<CommitAction> {
        let (status, key) = {
            let txn = self.get(id)?;
            (txn.status, txn.collision_key.clone())
        };
        if status != TransactionStatus::Uncommitted {
            return Err(invalid_state(id, status, "commit"));
        }
        let is_head = match key {
            None => true,
            Some(key) => {
                let queue = self.collision_queues.entry(key).or_default();
                queue.push_back(id);
                queue.front() == Some(&id)
            }
        };
        let txn = self.get_mut(id)?;
        if is_head {
            txn.status = TransactionStatus::Committing;
            Ok(CommitAction::Dispatch)
        } else {
            txn.status = TransactionStatus::CommitQueued;
            tracing::debug!(transaction = id, "commit queued behind collision key");
            Ok(CommitAction::Queued)
        }
    }

    /// Record a server acknowledgement. The transaction leaves the queue
    /// entirely; the returned identifier, if any, is the queued follower
    /// now promoted to `Committing`, which the caller must dispatch.
    pub fn mark_committed(&mut self, id: TransactionId) -> Result<Option<TransactionId>> {
        {
            let txn = self.get(id)?;
            if txn.status != TransactionStatus::Committing {
                return Err(invalid_state(id, txn.status, "mark committed"));
            }
        }
        let next = self.pop_collision_head(id);
        self.remove(id);
        if let Some(next_id) = next {
            if let Some(follower) = self.transactions.get_mut(&next_id) {
                follower.status = TransactionStatus::Committing;
            }
        }
        tracing::debug!(transaction = id, "transaction committed");
        Ok(next)
    }

    /// Record a server failure. Queued followers behind the same collision
    /// key are force-failed without dispatch and their optimistic payloads
    /// dropped; the failed head keeps or drops its own per `recovery`.
    pub fn mark_failed(
        &mut self,
        id: TransactionId,
        recovery: ErrorRecovery,
    ) -> Result<FailureOutcome> {
        {
            let txn = self.get(id)?;
            if txn.status != TransactionStatus::Committing {
                return Err(invalid_state(id, txn.status, "mark failed"));
            }
        }
        let cascade = self.drain_collision_followers(id);
        for follower_id in &cascade {
            if let Some(follower) = self.transactions.get_mut(follower_id) {
                follower.status = TransactionStatus::CollisionCommitFailed;
                follower.optimistic = None;
            }
        }

        let rolled_back = recovery == ErrorRecovery::Rollback;
        let txn = self.get_mut(id)?;
        txn.status = TransactionStatus::CommitFailed;
        if rolled_back {
            txn.optimistic = None;
        }
        tracing::warn!(
            transaction = id,
            rolled_back,
            cascade = cascade.len(),
            "transaction failed"
        );
        Ok(FailureOutcome {
            rolled_back,
            cascade,
        })
    }

    /// Explicitly roll back a transaction that is not in flight. The
    /// transaction leaves the queue.
    pub fn rollback(&mut self, id: TransactionId) -> Result<()> {
        let status = self.status(id)?;
        if matches!(status, TransactionStatus::Committing) {
            return Err(invalid_state(id, status, "rollback"));
        }
        self.pop_from_collision_queue(id);
        self.remove(id);
        tracing::debug!(transaction = id, "transaction rolled back");
        Ok(())
    }

    /// Optimistic payloads of transactions still carrying one, in creation
    /// order. The queued tier is rebuilt by replaying these from scratch.
    pub fn optimistic_updates(&self) -> Vec<&OptimisticUpdate> {
        self.order
            .iter()
            .filter_map(|id| self.transactions.get(id))
            .filter_map(|t| t.optimistic.as_ref())
            .collect()
    }

    /// Any transaction whose optimistic payload is still applied.
    pub fn has_pending_optimistic(&self) -> bool {
        self.transactions.values().any(|t| t.optimistic.is_some())
    }

    /// Drop terminal transactions so status bookkeeping does not grow
    /// without bound.
    pub fn purge_terminal(&mut self) {
        let terminal: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in terminal {
            self.remove(id);
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    fn get(&self, id: TransactionId) -> Result<&Transaction> {
        self.transactions
            .get(&id)
            .ok_or(CacheError::TransactionNotFound(id))
    }

    fn get_mut(&mut self, id: TransactionId) -> Result<&mut Transaction> {
        self.transactions
            .get_mut(&id)
            .ok_or(CacheError::TransactionNotFound(id))
    }

    fn remove(&mut self, id: TransactionId) {
        self.transactions.remove(&id);
        self.order.retain(|x| *x != id);
    }

    /// Remove `id` from the front of its collision queue and return the
    /// new head if it is waiting to be dispatched.
    fn pop_collision_head(&mut self, id: TransactionId) -> Option<TransactionId> {
        let key = self.transactions.get(&id)?.collision_key.clone()?;
        let queue = self.collision_queues.get_mut(&key)?;
        if queue.front() == Some(&id) {
            queue.pop_front();
        } else {
            queue.retain(|x| *x != id);
        }
        let next = queue.front().copied();
        if queue.is_empty() {
            self.collision_queues.remove(&key);
        }
        next.filter(|next_id| {
            self.transactions
                .get(next_id)
                .map(|t| t.status == TransactionStatus::CommitQueued)
                .unwrap_or(false)
        })
    }

    fn pop_from_collision_queue(&mut self, id: TransactionId) {
        let Some(key) = self
            .transactions
            .get(&id)
            .and_then(|t| t.collision_key.clone())
        else {
            return;
        };
        if let Some(queue) = self.collision_queues.get_mut(&key) {
            queue.retain(|x| *x != id);
            if queue.is_empty() {
                self.collision_queues.remove(&key);
            }
        }
    }

    /// Remove and return every follower behind `id` in its collision queue,
    /// in queue order. Queue membership starts at `begin_commit`, so every
    /// follower here has asked to commit.
    fn drain_collision_followers(&mut self, id: TransactionId) -> Vec<TransactionId> {
        let Some(key) = self
            .transactions
            .get(&id)
            .and_then(|t| t.collision_key.clone())
        else {
            return Vec::new();
        };
        let Some(queue) = self.collision_queues.remove(&key) else {
            return Vec::new();
        };
        queue.into_iter().filter(|x| *x != id).collect()
    }
}

fn invalid_state(id: TransactionId, status: TransactionStatus, action: &'static str) -> CacheError {
    CacheError::InvalidTransactionState {
        id,
        status: status.name(),
        action,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
