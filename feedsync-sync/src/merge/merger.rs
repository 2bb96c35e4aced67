//! The stream merger and its owning handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use feedsync_core::{
    Diagnostic, EntityKey, EntityValue, FetchOrigin, QueryFilter, Record, SharedDiagnostics,
    StoreResult, Subscription,
};
use feedsync_store::CollectionSource;
use tracing::debug;

use super::state::{KeyChange, MergerState, Overlay};
use super::{KeyExtractor, MergeOptions, MergePhase, MergedListener, MergedView};
use crate::cache::KeyedEntityCache;
use crate::optimistic::{Comparator, OptimisticPatch, PatchId, PatchState, PatchTarget};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Merges one primary collection stream with keyed enrichment.
///
/// Owned through a [`MergedFeed`]. The merger is also the [`PatchTarget`]
/// for optimistic mutations of its collection: patches are overlaid on the
/// authoritative base until a primary snapshot reflects them.
///
/// The state lock is never held while the listener runs or while a
/// subscription is opened.
pub struct StreamMerger<T: Record, K, V> {
    this: Weak<Self>,
    state: Mutex<MergerState<T, K, V>>,
    /// Version of the last delivered view.
    delivered: Mutex<u64>,
    closed: AtomicBool,
    primary: Mutex<Option<Subscription>>,
    listener: MergedListener<T, V>,
    extract: KeyExtractor<T, K>,
    cache: KeyedEntityCache<K, V>,
    source: Arc<dyn CollectionSource<T>>,
    filter: QueryFilter,
    comparator: Option<Comparator<T>>,
    diagnostics: SharedDiagnostics,
}

impl<T: Record, K: EntityKey, V: EntityValue> StreamMerger<T, K, V> {
    /// Subscribe to `source` under `filter`, enriching every record with the
    /// cached entity `extract` points at.
    ///
    /// `listener` may run on the thread that caused the change and must not
    /// synchronously trigger another emission of the same feed.
    pub fn open<E, F>(
        source: Arc<dyn CollectionSource<T>>,
        cache: KeyedEntityCache<K, V>,
        filter: QueryFilter,
        extract: E,
        options: MergeOptions<T>,
        listener: F,
    ) -> MergedFeed<T, K, V>
    where
        E: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(MergedView<T, V>) + Send + Sync + 'static,
    {
        let merger = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(MergerState::new()),
            delivered: Mutex::new(0),
            closed: AtomicBool::new(false),
            primary: Mutex::new(None),
            listener: Arc::new(listener),
            extract: Arc::new(extract),
            cache,
            source,
            filter,
            comparator: options.comparator,
            diagnostics: options.diagnostics,
        });
        debug!(collection = %merger.filter.collection, "Opening merged feed");

        let weak = Arc::downgrade(&merger);
        let primary = merger.source.subscribe(
            &merger.filter,
            Arc::new(move |snapshot: StoreResult<Vec<T>>| {
                if let Some(merger) = weak.upgrade() {
                    merger.on_primary(snapshot);
                }
            }),
        );
        *lock(&merger.primary) = Some(primary);

        MergedFeed { merger }
    }

    pub fn phase(&self) -> MergePhase {
        lock(&self.state).phase
    }

    /// The current view, or `None` before the first primary snapshot.
    pub fn view(&self) -> Option<MergedView<T, V>> {
        let mut state = lock(&self.state);
        if state.phase == MergePhase::Idle {
            return None;
        }
        Some(state.build_view(self.extract.as_ref(), self.comparator.as_ref(), false))
    }

    /// Overlaid patches that have not been echoed yet.
    pub fn pending_patches(&self) -> Vec<(PatchId, PatchState)> {
        lock(&self.state)
            .overlays
            .iter()
            .map(|o| (o.patch_id, o.state))
            .collect()
    }

    /// Tear down the primary and enrichment subscriptions. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let enrichment = {
            let mut state = lock(&self.state);
            state.phase = MergePhase::Closed;
            state.enrichment_sub.take()
        };
        let primary = lock(&self.primary).take();
        drop(primary);
        drop(enrichment);
        debug!(collection = %self.filter.collection, "Merged feed closed");
    }

    /// One-shot fetch of the primary filter, applied as a primary snapshot.
    pub async fn refresh(&self) -> StoreResult<()> {
        match self.source.fetch(&self.filter).await {
            Ok(records) => {
                self.apply_base(records);
                Ok(())
            }
            Err(error) => {
                self.diagnostics.emit(Diagnostic::FetchFailed {
                    origin: FetchOrigin::Refresh,
                    key: self.filter.collection.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    fn on_primary(&self, snapshot: StoreResult<Vec<T>>) {
        match snapshot {
            Ok(records) => self.apply_base(records),
            // Keep the last good base.
            Err(error) => self.diagnostics.emit(Diagnostic::FetchFailed {
                origin: FetchOrigin::PrimaryStream,
                key: self.filter.collection.clone(),
                error,
            }),
        }
    }

    fn apply_base(&self, records: Vec<T>) {
        self.update(|state| {
            state.base = records;
            let echoed = state.clear_echoed();
            if echoed > 0 {
                debug!(echoed, "Optimistic patches superseded by feed");
            }
            if state.phase == MergePhase::Idle {
                state.phase = MergePhase::Primed;
            }
            true
        });
    }

    /// Run `change` under the state lock; if it reports a change, rebuild
    /// the key set and view, then resubscribe and deliver outside the lock.
    fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut MergerState<T, K, V>) -> bool,
    {
        let (key_change, view) = {
            let mut state = lock(&self.state);
            if state.phase == MergePhase::Closed || !change(&mut state) {
                return;
            }
            let key_change = state.key_change(self.extract.as_ref(), self.comparator.as_ref());
            let view = state.build_view(self.extract.as_ref(), self.comparator.as_ref(), true);
            (key_change, view)
        };
        if let Some(key_change) = key_change {
            self.resubscribe(key_change);
        }
        self.deliver(view);
    }

    /// Open the enrichment subscription for a new key set, then release the
    /// previous one, so keys in both sets keep a reference throughout.
    fn resubscribe(&self, change: KeyChange<K>) {
        let weak = self.this.clone();
        let generation = change.generation;
        let total = change.keys.len();
        let next = self
            .cache
            .subscribe_many(change.keys.into_iter(), move |values| {
                if let Some(merger) = weak.upgrade() {
                    merger.on_enrichment(generation, values);
                }
            });

        let released = {
            let mut state = lock(&self.state);
            let stale = state.phase == MergePhase::Closed
                || matches!(&state.enrichment_sub, Some((current, _)) if *current > generation);
            if stale {
                Some(next)
            } else {
                state
                    .enrichment_sub
                    .replace((generation, next))
                    .map(|(_, previous)| previous)
            }
        };
        drop(released);

        self.diagnostics.emit(Diagnostic::Resubscribed {
            added: change.added,
            removed: change.removed,
            total,
        });
    }

    fn on_enrichment(&self, generation: u64, values: HashMap<K, Option<V>>) {
        let view = {
            let mut state = lock(&self.state);
            if state.phase == MergePhase::Closed || state.generation != generation {
                return;
            }
            state.enrichment = values;
            if state.phase == MergePhase::Primed {
                state.phase = MergePhase::Subscribed;
            }
            state.build_view(self.extract.as_ref(), self.comparator.as_ref(), true)
        };
        self.deliver(view);
    }

    /// Deliver `view` unless a newer one already went out.
    fn deliver(&self, view: MergedView<T, V>) {
        let mut delivered = lock(&self.delivered);
        if self.closed.load(Ordering::Acquire) || view.version <= *delivered {
            return;
        }
        *delivered = view.version;
        (self.listener)(view);
    }
}

#[async_trait]
impl<T: Record, K: EntityKey, V: EntityValue> PatchTarget<T> for StreamMerger<T, K, V> {
    fn current(&self, id: &T::Id) -> Option<T> {
        lock(&self.state)
            .compose(self.comparator.as_ref())
            .into_iter()
            .find(|item| &item.record_id() == id)
    }

    fn apply(&self, patch: &OptimisticPatch<T>) {
        self.update(|state| {
            state.overlays.push(Overlay {
                patch_id: patch.id,
                op: patch.forward.clone(),
                state: PatchState::Pending,
            });
            true
        });
    }

    fn confirm(&self, patch_id: PatchId) {
        let mut state = lock(&self.state);
        if let Some(overlay) = state.overlays.iter_mut().find(|o| o.patch_id == patch_id) {
            overlay.state = PatchState::Confirmed;
        }
    }

    fn rollback(&self, patch: &OptimisticPatch<T>) {
        self.update(|state| state.remove_overlay(patch.id).is_some());
    }

    fn is_pending(&self, patch_id: PatchId) -> bool {
        lock(&self.state)
            .overlays
            .iter()
            .any(|o| o.patch_id == patch_id)
    }

    fn expire(&self, patch_id: PatchId) -> bool {
        let mut expired = false;
        self.update(|state| {
            expired = state.remove_overlay(patch_id).is_some();
            expired
        });
        expired
    }

    async fn refresh(&self) -> StoreResult<()> {
        StreamMerger::refresh(self).await
    }
}

/// Owning handle to a merged feed. Dropping it closes the feed.
pub struct MergedFeed<T: Record, K: EntityKey, V: EntityValue> {
    merger: Arc<StreamMerger<T, K, V>>,
}

impl<T: Record, K: EntityKey, V: EntityValue> MergedFeed<T, K, V> {
    /// The merger, for use as an optimistic patch target.
    pub fn merger(&self) -> &Arc<StreamMerger<T, K, V>> {
        &self.merger
    }

    pub fn phase(&self) -> MergePhase {
        self.merger.phase()
    }

    pub fn view(&self) -> Option<MergedView<T, V>> {
        self.merger.view()
    }

    pub fn pending_patches(&self) -> Vec<(PatchId, PatchState)> {
        self.merger.pending_patches()
    }

    pub async fn refresh(&self) -> StoreResult<()> {
        self.merger.refresh().await
    }

    pub fn close(&self) {
        self.merger.close();
    }
}

impl<T: Record, K: EntityKey, V: EntityValue> Drop for MergedFeed<T, K, V> {
    fn drop(&mut self) {
        self.merger.close();
    }
}
