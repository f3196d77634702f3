//! Turn-boundary task queue.
//!
//! The engine is single-threaded and cooperative: store mutations and reads
//! run to completion within one logical turn, and cross-turn work (batched
//! change broadcasts, deferred-fragment notifications, opportunistic GC) is
//! queued here and drained at the next turn boundary by
//! `CacheEngine::run_until_idle`.
//!
//! Tasks of the same kind coalesce: scheduling `BroadcastChanges` twice in
//! one turn produces a single broadcast pass.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Deferred work executed at the next turn boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Flush the change emitter's staged identifiers to subscribers.
    BroadcastChanges,
    /// Flush the deferred-fragment tracker's batched events.
    BroadcastDeferred,
    /// Run a garbage collection pass.
    CollectGarbage,
}

impl Task {
    fn slot(self) -> usize {
        match self {
            Task::BroadcastChanges => 0,
            Task::BroadcastDeferred => 1,
            Task::CollectGarbage => 2,
        }
    }
}

/// Coalescing command queue drained between turns.
pub struct TaskQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
    /// One flag per task kind; set while that kind is queued.
    scheduled: [bool; 3],
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            scheduled: [false; 3],
        }
    }

    /// Queue a task unless the same kind is already pending.
    pub fn schedule(&mut self, task: Task) {
        let slot = task.slot();
        if self.scheduled[slot] {
            return;
        }
        self.scheduled[slot] = true;
        // The receiver lives alongside the sender; send cannot fail.
        let _ = self.tx.send(task);
    }

    /// Take the next pending task, clearing its coalescing flag.
    pub fn next(&mut self) -> Option<Task> {
        match self.rx.try_recv() {
            Ok(task) => {
                self.scheduled[task.slot()] = false;
                Some(task)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let mut q = TaskQueue::new();
        q.schedule(Task::BroadcastChanges);
        q.schedule(Task::CollectGarbage);

        assert_eq!(q.next(), Some(Task::BroadcastChanges));
        assert_eq!(q.next(), Some(Task::CollectGarbage));
        assert_eq!(q.next(), None);
        assert!(q.is_idle());
    }

    #[test]
    fn same_kind_coalesces() {
        let mut q = TaskQueue::new();
        q.schedule(Task::BroadcastChanges);
        q.schedule(Task::BroadcastChanges);
        q.schedule(Task::BroadcastChanges);

        assert_eq!(q.next(), Some(Task::BroadcastChanges));
        assert_eq!(q.next(), None);
    }

    #[test]
    fn reschedulable_after_drain() {
        let mut q = TaskQueue::new();
        q.schedule(Task::BroadcastDeferred);
        assert_eq!(q.next(), Some(Task::BroadcastDeferred));

        q.schedule(Task::BroadcastDeferred);
        assert_eq!(q.next(), Some(Task::BroadcastDeferred));
    }
}
