//! Merging a primary collection stream with keyed enrichment.
//!
//! A [`StreamMerger`] subscribes to an ordered primary collection, derives
//! the distinct foreign keys its records reference, keeps one
//! `subscribe_many` registration on the [`KeyedEntityCache`] for that key
//! set, and re-emits a [`MergedView`] whenever either side changes.
//!
//! ```text
//! Idle --first snapshot--> Primed --enrichment attached--> Subscribed
//!   \__________________________|_______________________________/
//!                              v
//!                            Closed
//! ```
//!
//! [`KeyedEntityCache`]: crate::cache::KeyedEntityCache

mod chunked;
mod merger;
mod state;

use std::fmt;
use std::sync::Arc;

use feedsync_core::{tracing_diagnostics, SharedDiagnostics};

use crate::optimistic::Comparator;

pub use chunked::ChunkedCollectionSource;
pub use merger::{MergedFeed, StreamMerger};

/// Maps a primary record to the key of its enrichment entity.
pub type KeyExtractor<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

/// Receives every merged view.
pub type MergedListener<T, V> = Arc<dyn Fn(MergedView<T, V>) + Send + Sync>;

/// A primary record with its best-available enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched<T, V> {
    pub item: T,
    pub enrichment: Option<V>,
}

/// One emission of a merged feed, in primary-stream order.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedView<T, V> {
    /// Strictly increasing across the emissions of one feed.
    pub version: u64,
    pub items: Vec<Enriched<T, V>>,
}

impl<T, V> MergedView<T, V> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|e| &e.item)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergePhase {
    /// No primary snapshot yet.
    Idle,
    /// Base present, enrichment not attached yet.
    Primed,
    /// Enrichment attached; steady state.
    Subscribed,
    /// Torn down; nothing is emitted any more.
    Closed,
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergePhase::Idle => "idle",
            MergePhase::Primed => "primed",
            MergePhase::Subscribed => "subscribed",
            MergePhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Optional merger settings.
pub struct MergeOptions<T> {
    /// Where optimistic inserts land. Without one they go to the front.
    pub comparator: Option<Comparator<T>>,
    pub diagnostics: SharedDiagnostics,
}

impl<T> Default for MergeOptions<T> {
    fn default() -> Self {
        Self {
            comparator: None,
            diagnostics: tracing_diagnostics(),
        }
    }
}

impl<T> MergeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_comparator(mut self, comparator: Comparator<T>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: SharedDiagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}
