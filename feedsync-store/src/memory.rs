//! In-memory reference backing store.
//!
//! Implements every collaborator trait over plain maps so the sync core can
//! be exercised without a backend. Besides the behaviour a real store has
//! (change feeds, batch limits, write-through echoes), it offers failure
//! injection and call recording for tests.
//!
//! Change callbacks are invoked synchronously on the thread that caused the
//! change, after the store's lock has been released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use feedsync_core::{
    Document, EntityKey, EntityValue, Lookup, Participant, Post, ProfileSummary, QueryFilter,
    Record, Reply, StoreError, StoreResult, Subscription, TournamentMessage, UserId, WriteError,
};
use serde_json::Value;
use tracing::debug;

use crate::traits::{
    CollectionSource, EntitySource, Mutation, MutationSink, SnapshotCallback, ValueCallback,
    WriteAck,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Projection of a record onto the field map that query filters evaluate.
pub trait Queryable {
    fn to_fields(&self) -> Value;
}

macro_rules! queryable_via_serde {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Queryable for $ty {
                fn to_fields(&self) -> Value {
                    serde_json::to_value(self).unwrap_or(Value::Null)
                }
            }
        )*
    };
}

queryable_via_serde!(Post, Reply, TournamentMessage, Participant);

impl Queryable for Document {
    fn to_fields(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }
}

// ============================================================================
// KEYED ENTITIES
// ============================================================================

struct EntityState<K, V> {
    values: HashMap<K, V>,
    watchers: HashMap<K, Vec<(u64, ValueCallback<V>)>>,
    next_watch_id: u64,
    max_batch: usize,
    initial_snapshot: bool,
    lookup_delay: Option<Duration>,
    failing_points: HashSet<K>,
    failing_batches: HashSet<K>,
    point_calls: Vec<K>,
    batch_calls: Vec<Vec<K>>,
    watch_calls: usize,
}

/// In-memory keyed entity table with live watches.
pub struct InMemoryEntities<K, V> {
    state: Arc<Mutex<EntityState<K, V>>>,
}

impl<K, V> Clone for InMemoryEntities<K, V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K: EntityKey, V: EntityValue> InMemoryEntities<K, V> {
    /// Create an empty table whose batch lookups accept `max_batch` keys.
    pub fn new(max_batch: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(EntityState {
                values: HashMap::new(),
                watchers: HashMap::new(),
                next_watch_id: 0,
                max_batch,
                initial_snapshot: true,
                lookup_delay: None,
                failing_points: HashSet::new(),
                failing_batches: HashSet::new(),
                point_calls: Vec::new(),
                batch_calls: Vec::new(),
                watch_calls: 0,
            })),
        }
    }

    /// Whether a new watch immediately receives the current value.
    pub fn set_initial_snapshot(&self, enabled: bool) {
        lock(&self.state).initial_snapshot = enabled;
    }

    /// Delay every point and batch lookup by `delay`.
    pub fn set_lookup_delay(&self, delay: Option<Duration>) {
        lock(&self.state).lookup_delay = delay;
    }

    /// Make point lookups of `key` fail.
    pub fn fail_point_lookup(&self, key: K) {
        lock(&self.state).failing_points.insert(key);
    }

    /// Make any batch lookup containing `key` fail.
    pub fn fail_batch_containing(&self, key: K) {
        lock(&self.state).failing_batches.insert(key);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.failing_points.clear();
        state.failing_batches.clear();
    }

    /// Store a value and notify watchers of the key.
    pub fn set(&self, key: K, value: V) {
        let callbacks = {
            let mut state = lock(&self.state);
            state.values.insert(key.clone(), value.clone());
            Self::callbacks_for(&state, &key)
        };
        for callback in callbacks {
            callback(Ok(Some(value.clone())));
        }
    }

    /// Delete a value and notify watchers of the key.
    pub fn remove(&self, key: &K) {
        let callbacks = {
            let mut state = lock(&self.state);
            state.values.remove(key);
            Self::callbacks_for(&state, key)
        };
        for callback in callbacks {
            callback(Ok(None));
        }
    }

    /// Deliver an error to every watcher of `key`.
    pub fn emit_error(&self, key: &K, error: StoreError) {
        let callbacks = Self::callbacks_for(&lock(&self.state), key);
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    /// Number of open watches on `key`.
    pub fn active_watches(&self, key: &K) -> usize {
        lock(&self.state).watchers.get(key).map_or(0, Vec::len)
    }

    /// Number of open watches across all keys.
    pub fn total_active_watches(&self) -> usize {
        lock(&self.state).watchers.values().map(Vec::len).sum()
    }

    /// Number of watches ever opened.
    pub fn watch_calls(&self) -> usize {
        lock(&self.state).watch_calls
    }

    /// Keys passed to point lookups, in call order.
    pub fn point_calls(&self) -> Vec<K> {
        lock(&self.state).point_calls.clone()
    }

    /// Key chunks passed to batch lookups, in call order.
    pub fn batch_calls(&self) -> Vec<Vec<K>> {
        lock(&self.state).batch_calls.clone()
    }

    fn callbacks_for(state: &EntityState<K, V>, key: &K) -> Vec<ValueCallback<V>> {
        state
            .watchers
            .get(key)
            .map(|ws| ws.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn unwatch(state: &Weak<Mutex<EntityState<K, V>>>, key: &K, watch_id: u64) {
        let Some(state) = state.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        if let Some(watchers) = state.watchers.get_mut(key) {
            watchers.retain(|(id, _)| *id != watch_id);
            if watchers.is_empty() {
                state.watchers.remove(key);
            }
        }
    }
}

#[async_trait]
impl<K: EntityKey, V: EntityValue> EntitySource<K, V> for InMemoryEntities<K, V> {
    async fn point_lookup(&self, key: &K) -> StoreResult<Lookup<V>> {
        let delay = {
            let mut state = lock(&self.state);
            state.point_calls.push(key.clone());
            state.lookup_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = lock(&self.state);
        if state.failing_points.contains(key) {
            return Err(StoreError::Unavailable {
                reason: format!("injected point lookup failure for {:?}", key),
            });
        }
        Ok(state.values.get(key).cloned().into())
    }

    async fn batch_lookup(&self, keys: &[K]) -> StoreResult<HashMap<K, V>> {
        let delay = {
            let mut state = lock(&self.state);
            state.batch_calls.push(keys.to_vec());
            if keys.len() > state.max_batch {
                return Err(StoreError::BatchTooLarge {
                    requested: keys.len(),
                    limit: state.max_batch,
                });
            }
            state.lookup_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = lock(&self.state);
        if keys.iter().any(|k| state.failing_batches.contains(k)) {
            return Err(StoreError::Backend {
                reason: "injected batch failure".to_string(),
            });
        }
        Ok(keys
            .iter()
            .filter_map(|k| state.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn max_batch_size(&self) -> usize {
        lock(&self.state).max_batch
    }

    fn watch(&self, key: &K, on_change: ValueCallback<V>) -> Subscription {
        let (watch_id, initial) = {
            let mut state = lock(&self.state);
            let watch_id = state.next_watch_id;
            state.next_watch_id += 1;
            state.watch_calls += 1;
            state
                .watchers
                .entry(key.clone())
                .or_default()
                .push((watch_id, Arc::clone(&on_change)));
            let initial = state
                .initial_snapshot
                .then(|| state.values.get(key).cloned());
            (watch_id, initial)
        };
        debug!(key = ?key, watch_id, "Watch opened");

        if let Some(initial) = initial {
            on_change(Ok(initial));
        }

        let weak = Arc::downgrade(&self.state);
        let key = key.clone();
        Subscription::new(move || Self::unwatch(&weak, &key, watch_id))
    }
}

// ============================================================================
// COLLECTIONS
// ============================================================================

struct Subscriber<T> {
    id: u64,
    filter: QueryFilter,
    callback: SnapshotCallback<T>,
    last: Option<Vec<T>>,
}

struct CollectionState<T: Record> {
    records: Vec<T>,
    subscribers: Vec<Subscriber<T>>,
    next_subscriber_id: u64,
    subscribe_calls: usize,
    initial_snapshot: bool,
    echo_writes: bool,
    write_failure: Option<WriteError>,
    write_delay: Option<Duration>,
    writes: Vec<Mutation<T>>,
}

/// In-memory ordered collection with filtered change feeds.
///
/// One instance models one collection; `QueryFilter::collection` is not
/// consulted.
pub struct InMemoryCollection<T: Record> {
    state: Arc<Mutex<CollectionState<T>>>,
}

impl<T: Record> Clone for InMemoryCollection<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Record + Queryable> Default for InMemoryCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record + Queryable> InMemoryCollection<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectionState {
                records: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                subscribe_calls: 0,
                initial_snapshot: true,
                echo_writes: true,
                write_failure: None,
                write_delay: None,
                writes: Vec::new(),
            })),
        }
    }

    /// Whether a new subscriber immediately receives the current result set.
    pub fn set_initial_snapshot(&self, enabled: bool) {
        lock(&self.state).initial_snapshot = enabled;
    }

    /// Whether successful writes are applied (and so echoed to feeds).
    pub fn set_echo_writes(&self, enabled: bool) {
        lock(&self.state).echo_writes = enabled;
    }

    /// Make every write fail with `failure` until cleared with `None`.
    pub fn set_write_failure(&self, failure: Option<WriteError>) {
        lock(&self.state).write_failure = failure;
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        lock(&self.state).write_delay = delay;
    }

    /// Insert or replace a record by id and publish.
    pub fn upsert(&self, record: T) {
        let notifications = {
            let mut state = lock(&self.state);
            Self::apply_upsert(&mut state.records, record);
            Self::publish(&mut state)
        };
        Self::deliver(notifications);
    }

    /// Remove a record by id and publish.
    pub fn remove(&self, id: &T::Id) {
        let notifications = {
            let mut state = lock(&self.state);
            state.records.retain(|r| &r.record_id() != id);
            Self::publish(&mut state)
        };
        Self::deliver(notifications);
    }

    /// Replace the whole collection and publish.
    pub fn replace_all(&self, records: Vec<T>) {
        let notifications = {
            let mut state = lock(&self.state);
            state.records = records;
            Self::publish(&mut state)
        };
        Self::deliver(notifications);
    }

    /// Deliver an error to every subscriber.
    pub fn emit_error(&self, error: StoreError) {
        let callbacks: Vec<_> = lock(&self.state)
            .subscribers
            .iter()
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(Err(error.clone()));
        }
    }

    /// Current records matching `filter`, ordered and limited.
    pub fn query(&self, filter: &QueryFilter) -> Vec<T> {
        Self::run_query(&lock(&self.state).records, filter)
    }

    /// Look up one record by id.
    pub fn get(&self, id: &T::Id) -> Option<T> {
        lock(&self.state)
            .records
            .iter()
            .find(|r| &r.record_id() == id)
            .cloned()
    }

    /// Number of open change feeds.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Number of change feeds ever opened.
    pub fn subscribe_calls(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    /// Filters of the currently open change feeds.
    pub fn active_filters(&self) -> Vec<QueryFilter> {
        lock(&self.state)
            .subscribers
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    /// Every write received, in order.
    pub fn writes(&self) -> Vec<Mutation<T>> {
        lock(&self.state).writes.clone()
    }

    fn apply_upsert(records: &mut Vec<T>, record: T) {
        let id = record.record_id();
        match records.iter_mut().find(|r| r.record_id() == id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    fn run_query(records: &[T], filter: &QueryFilter) -> Vec<T> {
        let mut rows: Vec<(Value, &T)> = records
            .iter()
            .map(|r| (r.to_fields(), r))
            .filter(|(fields, _)| filter.matches(fields))
            .collect();
        rows.sort_by(|a, b| filter.compare_documents(&a.0, &b.0));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows.into_iter().map(|(_, r)| r.clone()).collect()
    }

    fn publish(state: &mut CollectionState<T>) -> Vec<(SnapshotCallback<T>, Vec<T>)> {
        let CollectionState {
            records,
            subscribers,
            ..
        } = state;
        let mut notifications = Vec::new();
        for subscriber in subscribers.iter_mut() {
            let snapshot = Self::run_query(records, &subscriber.filter);
            if subscriber.last.as_ref() == Some(&snapshot) {
                continue;
            }
            subscriber.last = Some(snapshot.clone());
            notifications.push((Arc::clone(&subscriber.callback), snapshot));
        }
        notifications
    }

    fn deliver(notifications: Vec<(SnapshotCallback<T>, Vec<T>)>) {
        for (callback, snapshot) in notifications {
            callback(Ok(snapshot));
        }
    }

    fn unsubscribe(state: &Weak<Mutex<CollectionState<T>>>, subscriber_id: u64) {
        if let Some(state) = state.upgrade() {
            lock(&state).subscribers.retain(|s| s.id != subscriber_id);
        }
    }
}

#[async_trait]
impl<T: Record + Queryable> CollectionSource<T> for InMemoryCollection<T> {
    fn subscribe(&self, filter: &QueryFilter, on_change: SnapshotCallback<T>) -> Subscription {
        let (subscriber_id, initial) = {
            let mut state = lock(&self.state);
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribe_calls += 1;
            let initial = state
                .initial_snapshot
                .then(|| Self::run_query(&state.records, filter));
            state.subscribers.push(Subscriber {
                id,
                filter: filter.clone(),
                callback: Arc::clone(&on_change),
                last: initial.clone(),
            });
            (id, initial)
        };
        debug!(collection = %filter.collection, subscriber_id, "Change feed opened");

        if let Some(initial) = initial {
            on_change(Ok(initial));
        }

        let weak = Arc::downgrade(&self.state);
        Subscription::new(move || Self::unsubscribe(&weak, subscriber_id))
    }

    async fn fetch(&self, filter: &QueryFilter) -> StoreResult<Vec<T>> {
        Ok(self.query(filter))
    }
}

#[async_trait]
impl<T: Record + Queryable> MutationSink<T> for InMemoryCollection<T> {
    async fn write(&self, mutation: Mutation<T>) -> Result<WriteAck, WriteError> {
        let delay = {
            let mut state = lock(&self.state);
            state.writes.push(mutation.clone());
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (ack, notifications) = {
            let mut state = lock(&self.state);
            if let Some(failure) = state.write_failure.clone() {
                return Err(failure);
            }
            let document = match &mutation {
                Mutation::Upsert { collection, record } => {
                    format!("{}/{:?}", collection, record.record_id())
                }
                Mutation::Delete { collection, id } => format!("{}/{:?}", collection, id),
            };
            let notifications = if state.echo_writes {
                match mutation {
                    Mutation::Upsert { record, .. } => Self::apply_upsert(&mut state.records, record),
                    Mutation::Delete { id, .. } => state.records.retain(|r| r.record_id() != id),
                }
                Self::publish(&mut state)
            } else {
                Vec::new()
            };
            let ack = WriteAck {
                document,
                committed_at: Utc::now(),
            };
            (ack, notifications)
        };
        Self::deliver(notifications);
        Ok(ack)
    }
}

// ============================================================================
// BUNDLED STORE
// ============================================================================

/// Every collection the feeds read, plus the profile table.
#[derive(Clone)]
pub struct InMemoryBackingStore {
    profiles: InMemoryEntities<UserId, ProfileSummary>,
    posts: InMemoryCollection<Post>,
    replies: InMemoryCollection<Reply>,
    messages: InMemoryCollection<TournamentMessage>,
    participants: InMemoryCollection<Participant>,
}

impl InMemoryBackingStore {
    /// Create an empty store whose profile batch limit is `batch_limit`.
    pub fn new(batch_limit: usize) -> Self {
        Self {
            profiles: InMemoryEntities::new(batch_limit),
            posts: InMemoryCollection::new(),
            replies: InMemoryCollection::new(),
            messages: InMemoryCollection::new(),
            participants: InMemoryCollection::new(),
        }
    }

    pub fn profiles(&self) -> &InMemoryEntities<UserId, ProfileSummary> {
        &self.profiles
    }

    pub fn posts(&self) -> &InMemoryCollection<Post> {
        &self.posts
    }

    pub fn replies(&self) -> &InMemoryCollection<Reply> {
        &self.replies
    }

    pub fn messages(&self) -> &InMemoryCollection<TournamentMessage> {
        &self.messages
    }

    pub fn participants(&self) -> &InMemoryCollection<Participant> {
        &self.participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use feedsync_core::{PostId, SortDirection};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn post(id: &str, author: &str, secs: i64) -> Post {
        Post {
            id: PostId::new(id),
            author_id: UserId::new(author),
            body: String::new(),
            like_count: 0,
            reply_count: 0,
            tournament_id: None,
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn recording<T: Send + 'static>() -> (Arc<Mutex<Vec<StoreResult<T>>>>, Arc<dyn Fn(StoreResult<T>) + Send + Sync>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |v| sink.lock().unwrap().push(v)))
    }

    #[tokio::test]
    async fn test_point_and_batch_lookup() {
        let profiles = InMemoryEntities::<UserId, ProfileSummary>::new(2);
        profiles.set(UserId::new("a"), ProfileSummary::new("Alice"));

        let found = profiles.point_lookup(&UserId::new("a")).await.unwrap();
        assert_eq!(found, Lookup::Found(ProfileSummary::new("Alice")));
        let missing = profiles.point_lookup(&UserId::new("z")).await.unwrap();
        assert_eq!(missing, Lookup::NotFound);

        let batch = profiles
            .batch_lookup(&[UserId::new("a"), UserId::new("b")])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        let too_large = profiles
            .batch_lookup(&[UserId::new("a"), UserId::new("b"), UserId::new("c")])
            .await;
        assert!(matches!(too_large, Err(StoreError::BatchTooLarge { requested: 3, limit: 2 })));
        assert_eq!(profiles.batch_calls().len(), 2);
    }

    #[test]
    fn test_watch_delivers_initial_and_changes() {
        let profiles = InMemoryEntities::<UserId, ProfileSummary>::new(10);
        let key = UserId::new("a");
        let (seen, callback) = recording::<Option<ProfileSummary>>();

        let sub = profiles.watch(&key, callback);
        profiles.set(key.clone(), ProfileSummary::new("Alice"));
        profiles.remove(&key);
        assert_eq!(profiles.active_watches(&key), 1);

        sub.unsubscribe();
        profiles.set(key.clone(), ProfileSummary::new("Late"));
        assert_eq!(profiles.active_watches(&key), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], Ok(None));
        assert_eq!(seen[1], Ok(Some(ProfileSummary::new("Alice"))));
        assert_eq!(seen[2], Ok(None));
    }

    #[test]
    fn test_collection_feed_filters_orders_and_dedupes() {
        let posts = InMemoryCollection::<Post>::new();
        posts.upsert(post("p1", "a", 10));
        posts.upsert(post("p2", "b", 20));

        let filter = QueryFilter::collection("posts")
            .where_in("authorId", ["a", "b"])
            .order_by("createdAt", SortDirection::Descending);
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(Vec::new()));
        let (c, l) = (Arc::clone(&calls), Arc::clone(&last));
        let _sub = posts.subscribe(
            &filter,
            Arc::new(move |snapshot: StoreResult<Vec<Post>>| {
                c.fetch_add(1, Ordering::SeqCst);
                *l.lock().unwrap() = snapshot.unwrap();
            }),
        );

        // Outside the filter: no new snapshot.
        posts.upsert(post("p3", "c", 30));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        posts.upsert(post("p4", "a", 40));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let ids: Vec<_> = last.lock().unwrap().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["p4", "p2", "p1"]);
    }

    #[tokio::test]
    async fn test_write_echo_and_failure() {
        let posts = InMemoryCollection::<Post>::new();
        let ack = posts
            .write(Mutation::Upsert {
                collection: "posts".to_string(),
                record: post("p1", "a", 1),
            })
            .await
            .unwrap();
        assert!(ack.document.starts_with("posts/"));
        assert!(posts.get(&PostId::new("p1")).is_some());

        posts.set_write_failure(Some(WriteError::Rejected {
            reason: "denied".to_string(),
        }));
        let err = posts
            .write(Mutation::Delete {
                collection: "posts".to_string(),
                id: PostId::new("p1"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Rejected { .. }));
        assert!(posts.get(&PostId::new("p1")).is_some());
        assert_eq!(posts.writes().len(), 2);
    }

    #[test]
    fn test_unsubscribe_after_store_dropped_is_noop() {
        let posts = InMemoryCollection::<Post>::new();
        let sub = posts.subscribe(&QueryFilter::collection("posts"), Arc::new(|_| {}));
        drop(posts);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
