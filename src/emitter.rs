//! Change subscriptions.
//!
//! Subscribers watch a set of record identifiers. Writers stage changed
//! identifiers as they go; identifiers coalesce until `flush()` runs at the
//! turn boundary, when each subscriber is called once with the intersection
//! of the staged set and its watch set.

use std::collections::{HashMap, HashSet};

use crate::store::record::RecordId;

pub type SubscriptionId = u64;

type Callback = Box<dyn FnMut(&[RecordId])>;

struct Subscription {
    watched: HashSet<RecordId>,
    callback: Callback,
}

#[derive(Default)]
pub struct ChangeEmitter {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    staged: HashSet<RecordId>,
    next_id: SubscriptionId,
}

impl ChangeEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        watched: HashSet<RecordId>,
        callback: impl FnMut(&[RecordId]) + 'static,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.subscriptions.insert(
            id,
            Subscription {
                watched,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Replace a subscription's watch set, typically after the subscriber
    /// re-read and now observes different records. Returns false for an
    /// unknown subscription.
    pub fn update_watch(&mut self, id: SubscriptionId, watched: HashSet<RecordId>) -> bool {
        match self.subscriptions.get_mut(&id) {
            Some(sub) => {
                sub.watched = watched;
                true
            }
            None => {
                tracing::warn!(subscription = id, "watch update for unknown subscription");
                false
            }
        }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Stage changed record identifiers for the next broadcast.
    pub fn stage(&mut self, changed: impl IntoIterator<Item = RecordId>) {
        self.staged.extend(changed);
    }

    /// Notify every subscriber whose watch set intersects the staged set,
    /// then clear it. Each subscriber is called at most once per flush.
    pub fn flush(&mut self) {
        if self.staged.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut self.staged);
        for sub in self.subscriptions.values_mut() {
            let mut hit: Vec<RecordId> = sub
                .watched
                .intersection(&staged)
                .cloned()
                .collect();
            if hit.is_empty() {
                continue;
            }
            hit.sort();
            (sub.callback)(&hit);
        }
        tracing::debug!(changed = staged.len(), "change broadcast flushed");
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn watch(ids: &[&str]) -> HashSet<RecordId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn notifies_only_watching_subscribers() {
        let mut emitter = ChangeEmitter::new();
        let seen_a = Rc::new(RefCell::new(Vec::new()));
        let seen_b = Rc::new(RefCell::new(Vec::new()));

        let a = Rc::clone(&seen_a);
        emitter.subscribe(watch(&["1", "2"]), move |ids| {
            a.borrow_mut().extend(ids.to_vec());
        });
        let b = Rc::clone(&seen_b);
        emitter.subscribe(watch(&["3"]), move |ids| {
            b.borrow_mut().extend(ids.to_vec());
        });

        emitter.stage(["1".to_string()]);
        emitter.flush();

        assert_eq!(*seen_a.borrow(), vec!["1".to_string()]);
        assert!(seen_b.borrow().is_empty());
    }

    #[test]
    fn staged_ids_coalesce_into_one_callback() {
        let mut emitter = ChangeEmitter::new();
        let calls = Rc::new(RefCell::new(0usize));
        let seen = Rc::new(RefCell::new(Vec::new()));

        let calls2 = Rc::clone(&calls);
        let seen2 = Rc::clone(&seen);
        emitter.subscribe(watch(&["1", "2"]), move |ids| {
            *calls2.borrow_mut() += 1;
            seen2.borrow_mut().extend(ids.to_vec());
        });

        emitter.stage(["1".to_string()]);
        emitter.stage(["2".to_string(), "1".to_string()]);
        emitter.flush();

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(*seen.borrow(), vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn flush_clears_staged_set() {
        let mut emitter = ChangeEmitter::new();
        let calls = Rc::new(RefCell::new(0usize));
        let calls2 = Rc::clone(&calls);
        emitter.subscribe(watch(&["1"]), move |_| {
            *calls2.borrow_mut() += 1;
        });

        emitter.stage(["1".to_string()]);
        emitter.flush();
        emitter.flush();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn update_watch_replaces_the_set() {
        let mut emitter = ChangeEmitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let id = emitter.subscribe(watch(&["1"]), move |ids| {
            seen2.borrow_mut().extend(ids.to_vec());
        });

        assert!(emitter.update_watch(id, watch(&["2"])));
        emitter.stage(["1".to_string(), "2".to_string()]);
        emitter.flush();
        assert_eq!(*seen.borrow(), vec!["2".to_string()]);

        assert!(!emitter.update_watch(999, watch(&["1"])));
    }

    #[test]
    fn unsubscribed_callbacks_are_dropped() {
        let mut emitter = ChangeEmitter::new();
        let calls = Rc::new(RefCell::new(0usize));
        let calls2 = Rc::clone(&calls);
        let id = emitter.subscribe(watch(&["1"]), move |_| {
            *calls2.borrow_mut() += 1;
        });

        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));

        emitter.stage(["1".to_string()]);
        emitter.flush();
        assert_eq!(*calls.borrow(), 0);
    }
}
