//! Bounded batch lookups.
//!
//! Turns an ad hoc id set into chunked batch queries that respect the
//! backing store's per-request id-count limit. Results are merged into one
//! map holding exactly one entry per distinct requested id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use feedsync_core::{
    Diagnostic, EntityKey, EntityValue, Lookup, SharedDiagnostics, SyncConfig,
};
use feedsync_store::EntitySource;
use futures_util::future::join_all;
use tracing::debug;

/// Deduplicate `ids` (keeping first-seen order) and split them into chunks
/// of at most `limit` ids. A `limit` of zero is treated as one.
pub fn plan_chunks<K: EntityKey>(ids: &[K], limit: usize) -> Vec<Vec<K>> {
    let limit = limit.max(1);
    let mut seen = HashSet::with_capacity(ids.len());
    let distinct: Vec<K> = ids
        .iter()
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect();
    distinct.chunks(limit).map(<[K]>::to_vec).collect()
}

/// Chunked batch lookup over an [`EntitySource`].
pub struct BatchLookupScheduler<K, V> {
    source: Arc<dyn EntitySource<K, V>>,
    batch_limit: usize,
    diagnostics: SharedDiagnostics,
}

impl<K, V> Clone for BatchLookupScheduler<K, V> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            batch_limit: self.batch_limit,
            diagnostics: Arc::clone(&self.diagnostics),
        }
    }
}

impl<K: EntityKey, V: EntityValue> BatchLookupScheduler<K, V> {
    pub fn new(
        source: Arc<dyn EntitySource<K, V>>,
        config: &SyncConfig,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        Self {
            source,
            batch_limit: config.batch_limit,
            diagnostics,
        }
    }

    /// The chunk bound actually used: the smaller of the configured limit and
    /// the source's own limit, never below one.
    pub fn effective_limit(&self) -> usize {
        self.batch_limit.min(self.source.max_batch_size()).max(1)
    }

    /// The chunks [`lookup`](Self::lookup) would issue for `ids`.
    pub fn plan(&self, ids: &[K]) -> Vec<Vec<K>> {
        plan_chunks(ids, self.effective_limit())
    }

    /// Look up every id in `ids`.
    ///
    /// Chunks are issued concurrently. Ids absent from a response, and every
    /// id of a chunk that failed, map to [`Lookup::NotFound`]; a failed chunk
    /// is reported as [`Diagnostic::PartialBatchFailure`].
    pub async fn lookup(&self, ids: &[K]) -> HashMap<K, Lookup<V>> {
        let chunks = self.plan(ids);
        if chunks.is_empty() {
            return HashMap::new();
        }
        debug!(
            ids = ids.len(),
            chunks = chunks.len(),
            limit = self.effective_limit(),
            "Issuing batch lookup"
        );

        let responses = join_all(chunks.iter().map(|chunk| self.source.batch_lookup(chunk))).await;

        let mut merged = HashMap::with_capacity(ids.len());
        for (chunk_index, (chunk, response)) in chunks.into_iter().zip(responses).enumerate() {
            let mut found = match response {
                Ok(found) => found,
                Err(error) => {
                    self.diagnostics.emit(Diagnostic::PartialBatchFailure {
                        chunk_index,
                        ids: chunk.iter().map(|id| format!("{:?}", id)).collect(),
                        error,
                    });
                    HashMap::new()
                }
            };
            for id in chunk {
                let lookup = found.remove(&id).into();
                merged.insert(id, lookup);
            }
        }
        merged
    }
}
