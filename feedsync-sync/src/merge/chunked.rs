//! Fan-out of large `in` filters over several primary subscriptions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use feedsync_core::{QueryFilter, Record, StoreResult, Subscription};
use feedsync_store::{CollectionSource, SnapshotCallback};
use futures_util::future::try_join_all;
use tracing::debug;

use crate::optimistic::Comparator;

struct GroupResults<T> {
    /// Latest snapshot of each value group, by group index.
    groups: Vec<Option<Vec<T>>>,
    last: Option<Vec<T>>,
}

/// A [`CollectionSource`] that splits an oversized `in` constraint into
/// groups of at most `group_size` values, opens one inner subscription per
/// group and publishes one combined, globally sorted snapshot.
///
/// Nothing is published until every group has reported once. Filters whose
/// `in` constraint fits in one group pass straight through.
pub struct ChunkedCollectionSource<T: Record> {
    inner: Arc<dyn CollectionSource<T>>,
    group_size: usize,
    comparator: Comparator<T>,
    max_items: Option<usize>,
}

impl<T: Record> ChunkedCollectionSource<T> {
    pub fn new(inner: Arc<dyn CollectionSource<T>>, group_size: usize, comparator: Comparator<T>) -> Self {
        Self {
            inner,
            group_size: group_size.max(1),
            comparator,
            max_items: None,
        }
    }

    /// Cap the combined snapshot at `max` records.
    pub fn with_max_items(mut self, max: usize) -> Self {
        self.max_items = Some(max);
        self
    }

    pub fn with_max_items_opt(mut self, max: Option<usize>) -> Self {
        self.max_items = max;
        self
    }

    /// Per-group filters, or `None` if `filter` needs no fan-out.
    pub fn split(&self, filter: &QueryFilter) -> Option<Vec<QueryFilter>> {
        let (_, values) = filter.in_constraint()?;
        if values.len() <= self.group_size {
            return None;
        }
        Some(
            values
                .chunks(self.group_size)
                .map(|group| filter.with_in_values(group.to_vec()))
                .collect(),
        )
    }

    fn combine(
        comparator: &Comparator<T>,
        cap: Option<usize>,
        groups: impl IntoIterator<Item = Vec<T>>,
    ) -> Vec<T> {
        let mut seen = HashSet::new();
        let mut combined: Vec<T> = groups
            .into_iter()
            .flatten()
            .filter(|record| seen.insert(record.record_id()))
            .collect();
        combined.sort_by(|a, b| comparator(a, b));
        if let Some(cap) = cap {
            combined.truncate(cap);
        }
        combined
    }

    fn cap(&self, filter: &QueryFilter) -> Option<usize> {
        match (filter.limit, self.max_items) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[async_trait]
impl<T: Record> CollectionSource<T> for ChunkedCollectionSource<T> {
    fn subscribe(&self, filter: &QueryFilter, on_change: SnapshotCallback<T>) -> Subscription {
        let Some(filters) = self.split(filter) else {
            return self.inner.subscribe(filter, on_change);
        };
        debug!(
            collection = %filter.collection,
            groups = filters.len(),
            "Fanning out oversized in-filter"
        );

        let results = Arc::new(Mutex::new(GroupResults {
            groups: vec![None; filters.len()],
            last: None,
        }));
        let cap = self.cap(filter);

        let subscriptions = filters
            .iter()
            .enumerate()
            .map(|(index, group_filter)| {
                let results = Arc::clone(&results);
                let comparator = Arc::clone(&self.comparator);
                let on_change = Arc::clone(&on_change);
                self.inner.subscribe(
                    group_filter,
                    Arc::new(move |snapshot: StoreResult<Vec<T>>| {
                        let records = match snapshot {
                            Ok(records) => records,
                            Err(error) => return on_change(Err(error)),
                        };
                        let combined = {
                            let mut results = results.lock().unwrap_or_else(|p| p.into_inner());
                            results.groups[index] = Some(records);
                            if results.groups.iter().any(Option::is_none) {
                                return;
                            }
                            let combined = Self::combine(
                                &comparator,
                                cap,
                                results.groups.iter().flatten().cloned(),
                            );
                            if results.last.as_ref() == Some(&combined) {
                                return;
                            }
                            results.last = Some(combined.clone());
                            combined
                        };
                        on_change(Ok(combined));
                    }),
                )
            })
            .collect();

        Subscription::combine(subscriptions)
    }

    async fn fetch(&self, filter: &QueryFilter) -> StoreResult<Vec<T>> {
        let Some(filters) = self.split(filter) else {
            return self.inner.fetch(filter).await;
        };
        let groups = try_join_all(filters.iter().map(|f| self.inner.fetch(f))).await?;
        Ok(Self::combine(&self.comparator, self.cap(filter), groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use feedsync_core::{Post, PostId, SortDirection, UserId};
    use feedsync_store::InMemoryCollection;

    fn in_values(filter: &QueryFilter) -> Vec<serde_json::Value> {
        filter
            .in_constraint()
            .map(|(_, values)| values.to_vec())
            .unwrap_or_default()
    }

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

    fn newest_first() -> Comparator<Post> {
        Arc::new(|a: &Post, b: &Post| b.created_at.cmp(&a.created_at))
    }

    fn filter(authors: &[&str]) -> QueryFilter {
        QueryFilter::collection("posts")
            .where_in("authorId", authors.iter().copied())
            .order_by("createdAt", SortDirection::Descending)
    }

    #[test]
    fn test_split_only_oversized_filters() {
        let store = InMemoryCollection::<Post>::new();
        let source = ChunkedCollectionSource::new(Arc::new(store), 2, newest_first());
        assert!(source.split(&filter(&["a", "b"])).is_none());

        let groups = source.split(&filter(&["a", "b", "c", "d", "e"])).unwrap();
        let sizes: Vec<_> = groups.iter().map(|f| in_values(f).len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_combined_snapshot_sorted_capped_and_deduped() {
        let store = InMemoryCollection::<Post>::new();
        store.upsert(post("p1", "a", 10));
        store.upsert(post("p2", "c", 30));
        store.upsert(post("p3", "e", 20));
        store.upsert(post("p4", "b", 40));

        let source = ChunkedCollectionSource::new(Arc::new(store.clone()), 2, newest_first())
            .with_max_items(3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = source.subscribe(
            &filter(&["a", "b", "c", "d", "e"]),
            Arc::new(move |snapshot: StoreResult<Vec<Post>>| {
                let ids: Vec<String> = snapshot.unwrap().iter().map(|p| p.id.to_string()).collect();
                sink.lock().unwrap().push(ids);
            }),
        );
        assert_eq!(store.subscriber_count(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![vec!["p4", "p2", "p3"]]);

        // A change outside the top three still re-sorts, but publishes only
        // if the capped result changes.
        store.upsert(post("p5", "d", 5));
        assert_eq!(seen.lock().unwrap().len(), 1);

        store.upsert(post("p6", "d", 50));
        assert_eq!(seen.lock().unwrap().last().unwrap(), &vec!["p6", "p4", "p2"]);
    }

    #[tokio::test]
    async fn test_fetch_combines_groups() {
        let store = InMemoryCollection::<Post>::new();
        store.upsert(post("p1", "a", 10));
        store.upsert(post("p2", "e", 20));
        let source = ChunkedCollectionSource::new(Arc::new(store), 2, newest_first());

        let posts = source.fetch(&filter(&["a", "b", "c", "d", "e"])).await.unwrap();
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p2", "p1"]);
    }
}
