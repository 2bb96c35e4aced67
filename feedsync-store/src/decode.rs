//! Schema validation at the backing-store boundary.
//!
//! Adapters that turn raw-document sources into typed sources. Documents that
//! fail validation are dropped and reported through the diagnostics sink,
//! so one malformed row never blanks a whole feed.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use feedsync_core::{
    Decode, Diagnostic, Document, EntityKey, EntityValue, Lookup, QueryFilter, Record,
    SharedDiagnostics, StoreResult, Subscription,
};

use crate::traits::{CollectionSource, EntitySource, SnapshotCallback, ValueCallback};

fn decode_all<T: Decode>(docs: Vec<Document>, diagnostics: &SharedDiagnostics) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| decode_one(&doc, diagnostics))
        .collect()
}

fn decode_one<T: Decode>(doc: &Document, diagnostics: &SharedDiagnostics) -> Option<T> {
    match T::decode(doc) {
        Ok(value) => Some(value),
        Err(err) => {
            diagnostics.emit(Diagnostic::DocumentRejected {
                id: doc.id.clone(),
                reason: err.to_string(),
            });
            None
        }
    }
}

/// Typed view over a raw-document collection source.
pub struct DecodingCollectionSource<S, T> {
    inner: S,
    diagnostics: SharedDiagnostics,
    _record: PhantomData<fn() -> T>,
}

impl<S, T> DecodingCollectionSource<S, T>
where
    S: CollectionSource<Document>,
    T: Record + Decode,
{
    pub fn new(inner: S, diagnostics: SharedDiagnostics) -> Self {
        Self {
            inner,
            diagnostics,
            _record: PhantomData,
        }
    }
}

#[async_trait]
impl<S, T> CollectionSource<T> for DecodingCollectionSource<S, T>
where
    S: CollectionSource<Document>,
    T: Record + Decode,
{
    fn subscribe(&self, filter: &QueryFilter, on_change: SnapshotCallback<T>) -> Subscription {
        let diagnostics = Arc::clone(&self.diagnostics);
        self.inner.subscribe(
            filter,
            Arc::new(move |snapshot: StoreResult<Vec<Document>>| {
                on_change(snapshot.map(|docs| decode_all(docs, &diagnostics)));
            }),
        )
    }

    async fn fetch(&self, filter: &QueryFilter) -> StoreResult<Vec<T>> {
        let docs = self.inner.fetch(filter).await?;
        Ok(decode_all(docs, &self.diagnostics))
    }
}

/// Typed view over a raw-document entity source.
///
/// A document that fails validation is treated as absent.
pub struct DecodingEntitySource<S, V> {
    inner: S,
    diagnostics: SharedDiagnostics,
    _value: PhantomData<fn() -> V>,
}

impl<S, V> DecodingEntitySource<S, V> {
    pub fn new(inner: S, diagnostics: SharedDiagnostics) -> Self {
        Self {
            inner,
            diagnostics,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<K, S, V> EntitySource<K, V> for DecodingEntitySource<S, V>
where
    K: EntityKey,
    S: EntitySource<K, Document>,
    V: EntityValue + Decode,
{
    async fn point_lookup(&self, key: &K) -> StoreResult<Lookup<V>> {
        let lookup = self.inner.point_lookup(key).await?;
        Ok(lookup
            .into_option()
            .and_then(|doc| decode_one(&doc, &self.diagnostics))
            .into())
    }

    async fn batch_lookup(&self, keys: &[K]) -> StoreResult<HashMap<K, V>> {
        let docs = self.inner.batch_lookup(keys).await?;
        Ok(docs
            .into_iter()
            .filter_map(|(key, doc)| decode_one(&doc, &self.diagnostics).map(|v| (key, v)))
            .collect())
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    fn watch(&self, key: &K, on_change: ValueCallback<V>) -> Subscription {
        let diagnostics = Arc::clone(&self.diagnostics);
        self.inner.watch(
            key,
            Arc::new(move |value: StoreResult<Option<Document>>| {
                on_change(value.map(|doc| doc.and_then(|d| decode_one(&d, &diagnostics))));
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCollection, InMemoryEntities};
    use feedsync_core::{DiagnosticSink, Post, ProfileSummary, UserId};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Diagnostic>>);

    impl DiagnosticSink for Collect {
        fn emit(&self, diagnostic: Diagnostic) {
            self.0.lock().unwrap().push(diagnostic);
        }
    }

    #[tokio::test]
    async fn test_invalid_documents_are_dropped_and_reported() {
        let raw = InMemoryCollection::<Document>::new();
        raw.upsert(Document::new(
            "p1",
            json!({"authorId": "a", "createdAt": 1_000}),
        ));
        raw.upsert(Document::new("p2", json!({"createdAt": 2_000})));

        let sink = Arc::new(Collect::default());
        let typed: DecodingCollectionSource<_, Post> =
            DecodingCollectionSource::new(raw, sink.clone());

        let posts = typed.fetch(&QueryFilter::collection("posts")).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id.as_str(), "p1");

        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Diagnostic::DocumentRejected { id, .. } if id == "p2"));
    }

    #[tokio::test]
    async fn test_entity_decode_treats_invalid_as_absent() {
        let raw = InMemoryEntities::<UserId, Document>::new(10);
        raw.set(UserId::new("a"), Document::new("a", json!({"displayName": "Alice"})));
        raw.set(UserId::new("b"), Document::new("b", json!({"avatarUrl": "x"})));

        let typed: DecodingEntitySource<_, ProfileSummary> =
            DecodingEntitySource::new(raw, Arc::new(Collect::default()));

        let a = typed.point_lookup(&UserId::new("a")).await.unwrap();
        assert_eq!(a, Lookup::Found(ProfileSummary::new("Alice")));
        let b = typed.point_lookup(&UserId::new("b")).await.unwrap();
        assert_eq!(b, Lookup::NotFound);

        let batch = typed
            .batch_lookup(&[UserId::new("a"), UserId::new("b")])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }
}
