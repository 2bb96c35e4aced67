//! Merger state, guarded by the merger's lock.

use std::collections::{BTreeSet, HashMap};

use feedsync_core::{EntityKey, EntityValue, Record, Subscription};

use super::{Enriched, MergePhase, MergedView};
use crate::optimistic::{Comparator, PatchId, PatchOp, PatchState};

/// A patch laid over the authoritative base.
pub(crate) struct Overlay<T: Record> {
    pub patch_id: PatchId,
    pub op: PatchOp<T>,
    pub state: PatchState,
}

/// A new foreign-key set that needs its own enrichment subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct KeyChange<K> {
    pub generation: u64,
    pub keys: BTreeSet<K>,
    pub added: usize,
    pub removed: usize,
}

pub(crate) struct MergerState<T: Record, K, V> {
    pub phase: MergePhase,
    pub base: Vec<T>,
    pub overlays: Vec<Overlay<T>>,
    /// `None` until the first primary snapshot.
    pub keys: Option<BTreeSet<K>>,
    pub enrichment: HashMap<K, Option<V>>,
    /// Bumped on every key-set change; enrichment callbacks carry the
    /// generation they were opened for.
    pub generation: u64,
    pub enrichment_sub: Option<(u64, Subscription)>,
    /// Version of the most recently built view.
    pub version: u64,
}

impl<T: Record, K: EntityKey, V: EntityValue> MergerState<T, K, V> {
    pub fn new() -> Self {
        Self {
            phase: MergePhase::Idle,
            base: Vec::new(),
            overlays: Vec::new(),
            keys: None,
            enrichment: HashMap::new(),
            generation: 0,
            enrichment_sub: None,
            version: 0,
        }
    }

    /// Base with every overlay applied in patch order.
    pub fn compose(&self, comparator: Option<&Comparator<T>>) -> Vec<T> {
        let mut items = self.base.clone();
        for overlay in &self.overlays {
            overlay.op.apply_to(&mut items, comparator);
        }
        items
    }

    /// Drop overlays the base already reflects. Returns how many were dropped.
    pub fn clear_echoed(&mut self) -> usize {
        let before = self.overlays.len();
        let base = &self.base;
        self.overlays.retain(|overlay| !overlay.op.is_reflected_in(base));
        before - self.overlays.len()
    }

    pub fn remove_overlay(&mut self, patch_id: PatchId) -> Option<Overlay<T>> {
        let index = self.overlays.iter().position(|o| o.patch_id == patch_id)?;
        Some(self.overlays.remove(index))
    }

    /// Recompute the foreign-key set of the composed view. Returns the change
    /// if it differs from the previous set (or is the first one).
    pub fn key_change<E>(&mut self, extract: &E, comparator: Option<&Comparator<T>>) -> Option<KeyChange<K>>
    where
        E: Fn(&T) -> K + ?Sized,
    {
        let keys: BTreeSet<K> = self.compose(comparator).iter().map(extract).collect();
        let (added, removed) = match &self.keys {
            Some(previous) if *previous == keys => return None,
            Some(previous) => (
                keys.difference(previous).count(),
                previous.difference(&keys).count(),
            ),
            None => (keys.len(), 0),
        };
        self.generation += 1;
        self.keys = Some(keys.clone());
        Some(KeyChange {
            generation: self.generation,
            keys,
            added,
            removed,
        })
    }

    /// Build the current view, optionally under a fresh version.
    pub fn build_view<E>(&mut self, extract: &E, comparator: Option<&Comparator<T>>, bump: bool) -> MergedView<T, V>
    where
        E: Fn(&T) -> K + ?Sized,
    {
        if bump {
            self.version += 1;
        }
        let items = self
            .compose(comparator)
            .into_iter()
            .map(|item| {
                let enrichment = self.enrichment.get(&extract(&item)).cloned().flatten();
                Enriched { item, enrichment }
            })
            .collect();
        MergedView {
            version: self.version,
            items,
        }
    }
}
