//! A patch target without a live feed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use feedsync_core::{Record, Subscription};

use super::patch::{Comparator, OptimisticPatch, PatchId, PatchState, PatchTarget};

type CollectionListener<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

/// Settled patch states kept for [`LocalCollection::patch_state`].
pub const SETTLED_PATCH_HISTORY: usize = 64;

struct LocalState<T: Record> {
    items: Vec<T>,
    patches: HashMap<PatchId, PatchState>,
    settled: VecDeque<PatchId>,
    listeners: Vec<(u64, CollectionListener<T>)>,
    next_listener: u64,
}

impl<T: Record> LocalState<T> {
    /// Move a pending patch to `outcome`, evicting the oldest settled ones.
    fn settle(&mut self, patch_id: PatchId, outcome: PatchState) {
        match self.patches.get_mut(&patch_id) {
            Some(current) if *current == PatchState::Pending => *current = outcome,
            _ => return,
        }
        self.settled.push_back(patch_id);
        while self.settled.len() > SETTLED_PATCH_HISTORY {
            if let Some(oldest) = self.settled.pop_front() {
                self.patches.remove(&oldest);
            }
        }
    }
}

/// An ordered in-memory collection for screens with no change feed.
///
/// Forward ops are applied directly to the items and rolled back by
/// applying their reverse.
pub struct LocalCollection<T: Record> {
    state: Arc<Mutex<LocalState<T>>>,
    comparator: Option<Comparator<T>>,
}

impl<T: Record> LocalCollection<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState {
                items,
                patches: HashMap::new(),
                settled: VecDeque::new(),
                listeners: Vec::new(),
                next_listener: 0,
            })),
            comparator: None,
        }
    }

    /// Insert new records by `comparator` instead of at the front.
    pub fn with_comparator(mut self, comparator: Comparator<T>) -> Self {
        {
            let mut state = self.lock();
            state.items.sort_by(|a, b| comparator(a, b));
        }
        self.comparator = Some(comparator);
        self
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.clone()
    }

    /// State of a pending patch or one of the most recently settled ones.
    pub fn patch_state(&self, patch_id: PatchId) -> Option<PatchState> {
        self.lock().patches.get(&patch_id).copied()
    }

    /// Receive the full collection after every change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.push((id, Arc::new(listener)));
            id
        };
        let weak: Weak<Mutex<LocalState<T>>> = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                state.listeners.retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, LocalState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `change` under the lock, then notify listeners outside it.
    fn update(&self, change: impl FnOnce(&mut LocalState<T>)) {
        let (items, listeners) = {
            let mut state = self.lock();
            change(&mut state);
            let listeners: Vec<_> = state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (state.items.clone(), listeners)
        };
        for listener in listeners {
            listener(items.clone());
        }
    }
}

#[async_trait]
impl<T: Record> PatchTarget<T> for LocalCollection<T> {
    fn current(&self, id: &T::Id) -> Option<T> {
        self.lock()
            .items
            .iter()
            .find(|item| &item.record_id() == id)
            .cloned()
    }

    fn apply(&self, patch: &OptimisticPatch<T>) {
        let comparator = self.comparator.as_ref();
        self.update(|state| {
            patch.forward.apply_to(&mut state.items, comparator);
            state.patches.insert(patch.id, PatchState::Pending);
        });
    }

    fn confirm(&self, patch_id: PatchId) {
        self.lock().settle(patch_id, PatchState::Confirmed);
    }

    fn rollback(&self, patch: &OptimisticPatch<T>) {
        let comparator = self.comparator.as_ref();
        self.update(|state| {
            patch.reverse.apply_to(&mut state.items, comparator);
            state.settle(patch.id, PatchState::Failed);
        });
    }

    // A confirmed write is final here; there is no echo to wait for.
    fn is_pending(&self, _patch_id: PatchId) -> bool {
        false
    }

    fn expire(&self, _patch_id: PatchId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimistic::PatchOp;
    use feedsync_core::Document;
    use serde_json::json;

    fn doc(id: &str) -> Document {
        Document::new(id, json!({}))
    }

    fn insert(id: PatchId, record: &str) -> OptimisticPatch<Document> {
        OptimisticPatch {
            id,
            forward: PatchOp::Upsert(doc(record)),
            reverse: PatchOp::Remove(record.to_string()),
            state: PatchState::Pending,
        }
    }

    #[test]
    fn test_settled_patch_history_is_bounded() {
        let target: LocalCollection<Document> = LocalCollection::new(Vec::new());
        let total = SETTLED_PATCH_HISTORY as PatchId + 10;
        for id in 1..=total {
            let patch = insert(id, &format!("d{}", id));
            target.apply(&patch);
            if id % 2 == 0 {
                target.confirm(id);
            } else {
                target.rollback(&patch);
            }
        }

        assert_eq!(target.lock().patches.len(), SETTLED_PATCH_HISTORY);
        assert_eq!(target.patch_state(1), None);
        assert_eq!(target.patch_state(total), Some(PatchState::Confirmed));
        assert_eq!(target.patch_state(total - 1), Some(PatchState::Failed));
    }

    #[test]
    fn test_pending_patches_are_never_evicted() {
        let target: LocalCollection<Document> = LocalCollection::new(Vec::new());
        target.apply(&insert(1, "held"));
        for id in 2..=SETTLED_PATCH_HISTORY as PatchId + 5 {
            target.apply(&insert(id, &format!("d{}", id)));
            target.confirm(id);
        }

        assert_eq!(target.patch_state(1), Some(PatchState::Pending));
        assert_eq!(target.lock().patches.len(), SETTLED_PATCH_HISTORY + 1);
    }

    #[test]
    fn test_unknown_patch_ids_are_ignored() {
        let target = LocalCollection::new(vec![doc("a")]);
        target.confirm(7);
        assert_eq!(target.patch_state(7), None);
        assert!(!target.is_pending(7));
    }
}
