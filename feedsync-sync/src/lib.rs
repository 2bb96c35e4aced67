//! FEEDSYNC Sync - Real-Time Feed Synchronization
//!
//! Multiplexes live subscriptions to a backing store's change feeds,
//! caches small keyed entities with reference-counted lifetime, and merges
//! primary collection streams with that cache into ordered, enriched
//! read-models. Mutations are applied locally first and rolled back if the
//! backend rejects them.
//!
//! # Components
//!
//! - [`KeyedEntityCache`]: one live watch per key, shared by every listener
//! - [`BatchLookupScheduler`]: chunked batch lookups under the store's id limit
//! - [`StreamMerger`]: primary stream plus enrichment, re-emitted on either change
//! - [`OptimisticMutationCoordinator`]: local-first writes with rollback
//! - [`FeedSync`]: one explicit instance bundling the above

pub mod batch;
pub mod cache;
pub mod container;
pub mod merge;
pub mod optimistic;

pub use batch::{plan_chunks, BatchLookupScheduler};
pub use cache::{CacheStats, GroupListener, KeyedEntityCache, Listener};
pub use container::FeedSync;
pub use merge::{
    ChunkedCollectionSource, Enriched, KeyExtractor, MergeOptions, MergePhase, MergedFeed,
    MergedListener, MergedView, StreamMerger,
};
pub use optimistic::{
    Comparator, LocalCollection, OptimisticMutationCoordinator, OptimisticPatch, Patch, PatchId,
    PatchOp, PatchState, PatchTarget,
};
