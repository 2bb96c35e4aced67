//! Public handle to a keyed entity cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use feedsync_core::{
    EntityKey, EntityValue, SharedDiagnostics, Subscription, SyncConfig, SyncError, SyncResult,
};
use feedsync_store::EntitySource;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::actor::{CacheActor, Command};
use super::CacheStats;
use crate::batch::BatchLookupScheduler;

/// Handle to one cache instance.
///
/// Cloning is cheap and every clone addresses the same entry table. The
/// instance shuts down when [`shutdown`](Self::shutdown) is called or the
/// last handle is dropped; subscriptions held past that point are inert.
pub struct KeyedEntityCache<K, V> {
    commands: mpsc::UnboundedSender<Command<K, V>>,
    next_id: Arc<AtomicU64>,
}

impl<K, V> Clone for KeyedEntityCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<K: EntityKey, V: EntityValue> KeyedEntityCache<K, V> {
    /// Create a cache over `source` and spawn its actor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        source: Arc<dyn EntitySource<K, V>>,
        config: &SyncConfig,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        let scheduler =
            BatchLookupScheduler::new(Arc::clone(&source), config, Arc::clone(&diagnostics));
        Self::with_scheduler(source, scheduler, config, diagnostics)
    }

    /// Create a cache that primes `subscribe_many` groups through `scheduler`.
    pub fn with_scheduler(
        source: Arc<dyn EntitySource<K, V>>,
        scheduler: BatchLookupScheduler<K, V>,
        config: &SyncConfig,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = CacheActor::new(source, scheduler, config.idle_ttl, diagnostics, tx.downgrade());
        tokio::spawn(actor.run(rx));
        debug!(idle_ttl = ?config.idle_ttl, "Keyed entity cache started");
        Self {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Listen to `key`.
    ///
    /// The first listener of a key starts a point lookup and opens the live
    /// watch; whichever resolves first is delivered. Later updates are
    /// delivered only when they differ from the cached value. A listener
    /// joining a loaded entry receives the cached value right away.
    pub fn subscribe<F>(&self, key: K, listener: F) -> Subscription
    where
        F: Fn(Option<V>) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        if !self.send(Command::Subscribe {
            id,
            key: key.clone(),
            listener: Arc::new(listener),
        }) {
            return Subscription::noop();
        }
        let weak = self.commands.downgrade();
        Subscription::new(move || {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Unsubscribe { id, key });
            }
        })
    }

    /// Listen to a set of keys as one unit.
    ///
    /// Keys are deduplicated. Entries that are neither loaded nor already
    /// being fetched are primed with one chunked batch lookup. `listener`
    /// receives the full map once every key has resolved and again on every
    /// change to any of them.
    pub fn subscribe_many<I, F>(&self, keys: I, listener: F) -> Subscription
    where
        I: IntoIterator<Item = K>,
        F: Fn(HashMap<K, Option<V>>) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        if !self.send(Command::SubscribeGroup {
            id,
            keys: keys.into_iter().collect(),
            listener: Arc::new(listener),
        }) {
            return Subscription::noop();
        }
        let weak = self.commands.downgrade();
        Subscription::new(move || {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::UnsubscribeGroup { id });
            }
        })
    }

    /// Overwrite the cached value of `key` locally and notify its listeners.
    /// Does nothing if `key` has no entry.
    pub fn prime(&self, key: K, value: V) {
        self.send(Command::Prime { key, value });
    }

    /// The cached value of `key`, if loaded and present.
    pub async fn peek(&self, key: &K) -> SyncResult<Option<V>> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Peek {
            key: key.clone(),
            reply,
        }) {
            return Err(SyncError::CacheClosed);
        }
        rx.await.map_err(|_| SyncError::CacheClosed)
    }

    /// Listeners plus group registrations currently holding `key`.
    pub async fn ref_count(&self, key: &K) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::RefCount {
            key: key.clone(),
            reply,
        }) {
            return Err(SyncError::CacheClosed);
        }
        rx.await.map_err(|_| SyncError::CacheClosed)
    }

    pub async fn stats(&self) -> SyncResult<CacheStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Stats { reply }) {
            return Err(SyncError::CacheClosed);
        }
        rx.await.map_err(|_| SyncError::CacheClosed)
    }

    /// Close every live watch and stop the actor.
    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, command: Command<K, V>) -> bool {
        let sent = self.commands.send(command).is_ok();
        if !sent {
            debug!("Keyed entity cache is closed, command dropped");
        }
        sent
    }
}
