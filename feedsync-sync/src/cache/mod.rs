//! Reference-counted keyed entity cache.
//!
//! Multiplexes live subscriptions to keyed entities (profile summaries by
//! user id) across many consumers. Every key has at most one open backend
//! watch regardless of how many listeners it has; the watch stays open for
//! an idle TTL after the last listener leaves so short-lived churn does not
//! reopen it.
//!
//! # Concurrency
//!
//! The entry table is owned by one actor task per cache instance. Handles
//! only enqueue commands, so `subscribe`, `subscribe_many`, `prime` and
//! unsubscribing never block. Fetches and timers run as spawned tasks that
//! report back tagged with the entry's epoch; results for an entry that has
//! since been torn down are dropped.
//!
//! Listeners are invoked on the actor task, in arrival order per key.

mod actor;
mod entry;
mod keyed;

use std::collections::HashMap;
use std::sync::Arc;

pub use keyed::KeyedEntityCache;

/// Receives the latest value of one key; `None` means the entity is absent.
pub type Listener<V> = Arc<dyn Fn(Option<V>) + Send + Sync>;

/// Receives the aggregated values of a key group.
pub type GroupListener<K, V> = Arc<dyn Fn(HashMap<K, Option<V>>) + Send + Sync>;

pub(crate) type ListenerId = u64;
pub(crate) type GroupId = u64;

/// Point-in-time counters for one cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently in the table.
    pub entries: usize,
    /// Entries with an open backend watch.
    pub live_subscriptions: usize,
    /// Entries with no listeners waiting for their idle TTL.
    pub idle_timers: usize,
    /// Registered `subscribe_many` groups.
    pub groups: usize,
}
