//! Id-keyed patch operations.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use feedsync_core::{Record, StoreResult};

/// Orders two records of a collection.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Identifies one optimistic mutation.
pub type PatchId = u64;

/// A change to an id-keyed collection. Never positional.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp<T: Record> {
    /// Replace the record with the same id, or insert it.
    Upsert(T),
    /// Remove the record with this id, if present.
    Remove(T::Id),
}

impl<T: Record> PatchOp<T> {
    pub fn record_id(&self) -> T::Id {
        match self {
            PatchOp::Upsert(record) => record.record_id(),
            PatchOp::Remove(id) => id.clone(),
        }
    }

    /// Apply to an ordered collection.
    ///
    /// An upsert of an existing id replaces it in place. A new record goes
    /// before the first element `comparator` orders after it, or at the
    /// front when there is no comparator.
    pub fn apply_to(&self, items: &mut Vec<T>, comparator: Option<&Comparator<T>>) {
        match self {
            PatchOp::Upsert(record) => {
                let id = record.record_id();
                if let Some(existing) = items.iter_mut().find(|item| item.record_id() == id) {
                    *existing = record.clone();
                    return;
                }
                let at = match comparator {
                    Some(cmp) => items.partition_point(|item| cmp(item, record) != Ordering::Greater),
                    None => 0,
                };
                items.insert(at, record.clone());
            }
            PatchOp::Remove(id) => items.retain(|item| &item.record_id() != id),
        }
    }

    /// Whether `items` already reflects this op.
    pub fn is_reflected_in(&self, items: &[T]) -> bool {
        match self {
            PatchOp::Upsert(record) => {
                let id = record.record_id();
                items.iter().any(|item| item.record_id() == id && item == record)
            }
            PatchOp::Remove(id) => items.iter().all(|item| &item.record_id() != id),
        }
    }
}

/// Lifecycle of an optimistic patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    /// Applied locally, write outstanding.
    Pending,
    /// Write acknowledged, waiting for the feed echo.
    Confirmed,
    /// Write failed or timed out; rolled back.
    Failed,
}

/// A local-first mutation and the op that undoes it.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPatch<T: Record> {
    pub id: PatchId,
    pub forward: PatchOp<T>,
    pub reverse: PatchOp<T>,
    pub state: PatchState,
}

impl<T: Record> OptimisticPatch<T> {
    pub fn record_id(&self) -> T::Id {
        self.forward.record_id()
    }
}

/// Caller-facing description of a mutation, resolved against the target's
/// current record.
pub enum Patch<T> {
    /// Write `T` as the new state of its id.
    Upsert(T),
    /// Derive the new state from the current one. Fails on unknown ids.
    Update(Box<dyn FnOnce(&T) -> T + Send>),
    /// Delete the record.
    Remove,
}

impl<T> Patch<T> {
    pub fn update<F>(f: F) -> Self
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        Patch::Update(Box::new(f))
    }
}

impl<T: fmt::Debug> fmt::Debug for Patch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Upsert(record) => f.debug_tuple("Upsert").field(record).finish(),
            Patch::Update(_) => f.write_str("Update(..)"),
            Patch::Remove => f.write_str("Remove"),
        }
    }
}

/// A collection that optimistic patches can be applied to.
///
/// Implementations emit their new state synchronously from `apply` and
/// `rollback`.
#[async_trait]
pub trait PatchTarget<T: Record>: Send + Sync {
    /// The record as the target currently presents it, patches included.
    fn current(&self, id: &T::Id) -> Option<T>;

    /// Apply `patch.forward` ahead of the write.
    fn apply(&self, patch: &OptimisticPatch<T>);

    /// The write for `patch_id` succeeded.
    fn confirm(&self, patch_id: PatchId);

    /// The write failed; restore the pre-patch state.
    fn rollback(&self, patch: &OptimisticPatch<T>);

    /// Whether `patch_id` is still overlaid, waiting for its echo.
    fn is_pending(&self, patch_id: PatchId) -> bool;

    /// Drop a confirmed patch that never saw its echo. Returns whether the
    /// patch was still present.
    fn expire(&self, patch_id: PatchId) -> bool;

    /// Re-read authoritative state.
    async fn refresh(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedsync_core::Document;
    use serde_json::json;

    fn doc(id: &str, rank: i64) -> Document {
        Document::new(id, json!({ "rank": rank }))
    }

    fn rank(d: &Document) -> i64 {
        d.fields.get("rank").and_then(|v| v.as_i64()).unwrap_or_default()
    }

    fn by_rank() -> Comparator<Document> {
        Arc::new(|a, b| rank(a).cmp(&rank(b)))
    }

    fn ids(items: &[Document]) -> Vec<&str> {
        items.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut items = vec![doc("a", 1), doc("b", 2)];
        PatchOp::Upsert(doc("a", 9)).apply_to(&mut items, Some(&by_rank()));
        assert_eq!(ids(&items), vec!["a", "b"]);
        assert_eq!(rank(&items[0]), 9);
    }

    #[test]
    fn test_upsert_inserts_by_comparator_or_front() {
        let mut items = vec![doc("a", 1), doc("c", 3)];
        PatchOp::Upsert(doc("b", 2)).apply_to(&mut items, Some(&by_rank()));
        assert_eq!(ids(&items), vec!["a", "b", "c"]);

        PatchOp::Upsert(doc("z", 0)).apply_to(&mut items, None);
        assert_eq!(ids(&items)[0], "z");
    }

    #[test]
    fn test_reverse_undoes_forward() {
        let original = vec![doc("a", 1), doc("b", 2), doc("c", 3)];
        let cmp = by_rank();

        let mut items = original.clone();
        PatchOp::Upsert(doc("d", 4)).apply_to(&mut items, Some(&cmp));
        PatchOp::<Document>::Remove("d".to_string()).apply_to(&mut items, Some(&cmp));
        assert_eq!(items, original);

        let mut items = original.clone();
        PatchOp::<Document>::Remove("b".to_string()).apply_to(&mut items, Some(&cmp));
        PatchOp::Upsert(doc("b", 2)).apply_to(&mut items, Some(&cmp));
        assert_eq!(items, original);
    }

    #[test]
    fn test_is_reflected_in() {
        let items = vec![doc("a", 1)];
        assert!(PatchOp::Upsert(doc("a", 1)).is_reflected_in(&items));
        assert!(!PatchOp::Upsert(doc("a", 2)).is_reflected_in(&items));
        assert!(PatchOp::<Document>::Remove("b".to_string()).is_reflected_in(&items));
        assert!(!PatchOp::<Document>::Remove("a".to_string()).is_reflected_in(&items));
    }
}
