//! Backing-store collaborator traits.
//!
//! These traits are the only contact surface between the sync core and a
//! concrete backend (Firestore, Supabase, the in-memory reference store).
//! Implementations must be thread-safe; change callbacks may be invoked from
//! any thread.

use async_trait::async_trait;
use feedsync_core::{
    EntityKey, EntityValue, Lookup, QueryFilter, Record, StoreResult, Subscription, Timestamp,
    WriteError,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Callback receiving the latest value of one watched key.
///
/// `Ok(None)` means the document does not exist (or was deleted).
pub type ValueCallback<V> = Arc<dyn Fn(StoreResult<Option<V>>) + Send + Sync>;

/// Callback receiving the full, ordered result set of a query.
pub type SnapshotCallback<T> = Arc<dyn Fn(StoreResult<Vec<T>>) + Send + Sync>;

/// Source of keyed entities (e.g. profile summaries by user id).
///
/// # Batch bound
///
/// `batch_lookup` accepts at most [`max_batch_size`](Self::max_batch_size)
/// keys per call; callers are expected to chunk. Keys absent from the
/// returned map do not exist.
#[async_trait]
pub trait EntitySource<K: EntityKey, V: EntityValue>: Send + Sync {
    /// Fetch one entity.
    async fn point_lookup(&self, key: &K) -> StoreResult<Lookup<V>>;

    /// Fetch up to `max_batch_size()` entities in one round trip.
    async fn batch_lookup(&self, keys: &[K]) -> StoreResult<HashMap<K, V>>;

    /// Backend per-request id-count limit.
    fn max_batch_size(&self) -> usize;

    /// Open a live change subscription on one key.
    fn watch(&self, key: &K, on_change: ValueCallback<V>) -> Subscription;
}

/// Source of ordered primary collections (posts, replies, messages, ...).
#[async_trait]
pub trait CollectionSource<T: Record>: Send + Sync {
    /// Open a change feed; `on_change` receives the full ordered result set
    /// on every change.
    fn subscribe(&self, filter: &QueryFilter, on_change: SnapshotCallback<T>) -> Subscription;

    /// One-shot query used for corrective refreshes.
    async fn fetch(&self, filter: &QueryFilter) -> StoreResult<Vec<T>>;
}

/// A remote mutation, addressed by record id.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<T: Record> {
    Upsert { collection: String, record: T },
    Delete { collection: String, id: T::Id },
}

impl<T: Record> Mutation<T> {
    pub fn collection(&self) -> &str {
        match self {
            Mutation::Upsert { collection, .. } | Mutation::Delete { collection, .. } => collection,
        }
    }
}

/// Backend acknowledgment of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub document: String,
    pub committed_at: Timestamp,
}

/// Sink for remote writes.
#[async_trait]
pub trait MutationSink<T: Record>: Send + Sync {
    async fn write(&self, mutation: Mutation<T>) -> Result<WriteAck, WriteError>;
}

#[async_trait]
impl<K, V, S> EntitySource<K, V> for Arc<S>
where
    K: EntityKey,
    V: EntityValue,
    S: EntitySource<K, V> + ?Sized,
{
    async fn point_lookup(&self, key: &K) -> StoreResult<Lookup<V>> {
        (**self).point_lookup(key).await
    }

    async fn batch_lookup(&self, keys: &[K]) -> StoreResult<HashMap<K, V>> {
        (**self).batch_lookup(keys).await
    }

    fn max_batch_size(&self) -> usize {
        (**self).max_batch_size()
    }

    fn watch(&self, key: &K, on_change: ValueCallback<V>) -> Subscription {
        (**self).watch(key, on_change)
    }
}

#[async_trait]
impl<T, S> CollectionSource<T> for Arc<S>
where
    T: Record,
    S: CollectionSource<T> + ?Sized,
{
    fn subscribe(&self, filter: &QueryFilter, on_change: SnapshotCallback<T>) -> Subscription {
        (**self).subscribe(filter, on_change)
    }

    async fn fetch(&self, filter: &QueryFilter) -> StoreResult<Vec<T>> {
        (**self).fetch(filter).await
    }
}
