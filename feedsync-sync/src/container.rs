//! One explicit instance of the synchronization layer.
//!
//! Bundles the cache, scheduler and coordinator built from one
//! [`SyncConfig`] and diagnostics sink. Tests construct a fresh instance
//! each; nothing is process-global.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use feedsync_core::{
    tracing_diagnostics, EntityKey, EntityValue, Lookup, QueryFilter, Record, SharedDiagnostics,
    Subscription, SyncConfig, SyncResult, WriteError,
};
use feedsync_store::{CollectionSource, EntitySource, MutationSink};
use tracing::info;

use crate::batch::BatchLookupScheduler;
use crate::cache::{CacheStats, KeyedEntityCache};
use crate::merge::{ChunkedCollectionSource, MergeOptions, MergedFeed, MergedView, StreamMerger};
use crate::optimistic::{Comparator, OptimisticMutationCoordinator, Patch};

/// The profile-enriched feed synchronization layer for one entity source.
pub struct FeedSync<K, V> {
    config: SyncConfig,
    diagnostics: SharedDiagnostics,
    cache: KeyedEntityCache<K, V>,
    scheduler: BatchLookupScheduler<K, V>,
    coordinator: OptimisticMutationCoordinator,
}

impl<K: EntityKey, V: EntityValue> FeedSync<K, V> {
    /// Build an instance logging diagnostics through `tracing`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(entities: Arc<dyn EntitySource<K, V>>, config: SyncConfig) -> SyncResult<Self> {
        Self::with_diagnostics(entities, config, tracing_diagnostics())
    }

    pub fn with_diagnostics(
        entities: Arc<dyn EntitySource<K, V>>,
        config: SyncConfig,
        diagnostics: SharedDiagnostics,
    ) -> SyncResult<Self> {
        config.validate()?;
        let scheduler =
            BatchLookupScheduler::new(Arc::clone(&entities), &config, Arc::clone(&diagnostics));
        let cache = KeyedEntityCache::with_scheduler(
            entities,
            scheduler.clone(),
            &config,
            Arc::clone(&diagnostics),
        );
        let coordinator = OptimisticMutationCoordinator::new(&config, Arc::clone(&diagnostics));
        info!(
            batch_limit = scheduler.effective_limit(),
            idle_ttl = ?config.idle_ttl,
            write_timeout = ?config.write_timeout,
            "Feed sync initialized"
        );
        Ok(Self {
            config,
            diagnostics,
            cache,
            scheduler,
            coordinator,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &SharedDiagnostics {
        &self.diagnostics
    }

    pub fn cache(&self) -> &KeyedEntityCache<K, V> {
        &self.cache
    }

    pub fn scheduler(&self) -> &BatchLookupScheduler<K, V> {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &OptimisticMutationCoordinator {
        &self.coordinator
    }

    pub fn subscribe<F>(&self, key: K, listener: F) -> Subscription
    where
        F: Fn(Option<V>) + Send + Sync + 'static,
    {
        self.cache.subscribe(key, listener)
    }

    pub fn subscribe_many<I, F>(&self, keys: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        F: Fn(HashMap<K, Option<V>>) + Send + Sync + 'static,
    {
        self.cache.subscribe_many(keys, listener)
    }

    pub fn prime(&self, key: K, value: V) {
        self.cache.prime(key, value);
    }

    /// One-shot chunked lookup, bypassing the cache.
    pub async fn lookup_many(&self, ids: &[K]) -> HashMap<K, Lookup<V>> {
        self.scheduler.lookup(ids).await
    }

    pub async fn stats(&self) -> SyncResult<CacheStats> {
        self.cache.stats().await
    }

    /// Merge `source` under `filter` with the cached entity `extract` points
    /// at. Optimistic inserts land at the front.
    pub fn merged_subscribe<T, E, F>(
        &self,
        source: Arc<dyn CollectionSource<T>>,
        filter: QueryFilter,
        extract: E,
        listener: F,
    ) -> MergedFeed<T, K, V>
    where
        T: Record,
        E: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(MergedView<T, V>) + Send + Sync + 'static,
    {
        let options = MergeOptions::new().with_diagnostics(Arc::clone(&self.diagnostics));
        StreamMerger::open(source, self.cache.clone(), filter, extract, options, listener)
    }

    /// Like [`merged_subscribe`](Self::merged_subscribe) for collections
    /// ordered by `comparator`. An `in` constraint larger than the batch
    /// limit is fanned out over several primary subscriptions, and the
    /// combined feed is capped at `max_merged_items` when configured.
    pub fn merged_subscribe_ordered<T, E, F>(
        &self,
        source: Arc<dyn CollectionSource<T>>,
        filter: QueryFilter,
        comparator: Comparator<T>,
        extract: E,
        listener: F,
    ) -> MergedFeed<T, K, V>
    where
        T: Record,
        E: Fn(&T) -> K + Send + Sync + 'static,
        F: Fn(MergedView<T, V>) + Send + Sync + 'static,
    {
        let chunked = ChunkedCollectionSource::new(
            source,
            self.config.batch_limit,
            Arc::clone(&comparator),
        )
        .with_max_items_opt(self.config.max_merged_items);
        let options = MergeOptions::new()
            .with_comparator(comparator)
            .with_diagnostics(Arc::clone(&self.diagnostics));
        StreamMerger::open(Arc::new(chunked), self.cache.clone(), filter, extract, options, listener)
    }

    /// Optimistically apply `patch` to `feed`, then run `write`.
    pub async fn mutate<T, Fut, W>(
        &self,
        feed: &MergedFeed<T, K, V>,
        id: T::Id,
        patch: Patch<T>,
        write: Fut,
    ) -> SyncResult<()>
    where
        T: Record,
        Fut: Future<Output = Result<W, WriteError>> + Send + 'static,
        W: Send + 'static,
    {
        self.coordinator.mutate(feed.merger(), id, patch, write).await
    }

    /// Optimistically apply `patch` to `feed` and write it to `sink`.
    pub async fn mutate_through<T>(
        &self,
        feed: &MergedFeed<T, K, V>,
        sink: Arc<dyn MutationSink<T>>,
        collection: &str,
        id: T::Id,
        patch: Patch<T>,
    ) -> SyncResult<()>
    where
        T: Record,
    {
        self.coordinator
            .mutate_through(feed.merger(), sink, collection, id, patch)
            .await
    }

    /// Close every live watch held by the cache.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }
}
