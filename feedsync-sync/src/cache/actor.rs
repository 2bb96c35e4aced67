//! The task that owns a cache's entry table.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use feedsync_core::{
    Diagnostic, EntityKey, EntityValue, FetchOrigin, Lookup, SharedDiagnostics, StoreResult,
    Subscription,
};
use feedsync_store::EntitySource;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::entry::{Applied, CacheEntry, IdleTimer};
use super::{CacheStats, GroupId, GroupListener, Listener, ListenerId};
use crate::batch::BatchLookupScheduler;

pub(crate) enum Command<K, V> {
    Subscribe {
        id: ListenerId,
        key: K,
        listener: Listener<V>,
    },
    Unsubscribe {
        id: ListenerId,
        key: K,
    },
    SubscribeGroup {
        id: GroupId,
        keys: Vec<K>,
        listener: GroupListener<K, V>,
    },
    UnsubscribeGroup {
        id: GroupId,
    },
    Prime {
        key: K,
        value: V,
    },
    Resolved {
        key: K,
        epoch: u64,
        origin: FetchOrigin,
        result: StoreResult<Option<V>>,
    },
    BatchResolved {
        epochs: Vec<(K, u64)>,
        results: HashMap<K, Lookup<V>>,
    },
    IdleExpired {
        key: K,
        token: u64,
    },
    Peek {
        key: K,
        reply: oneshot::Sender<Option<V>>,
    },
    RefCount {
        key: K,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<CacheStats>,
    },
    Shutdown,
}

struct Group<K, V> {
    keys: Vec<K>,
    listener: GroupListener<K, V>,
}

pub(crate) struct CacheActor<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    groups: HashMap<GroupId, Group<K, V>>,
    source: Arc<dyn EntitySource<K, V>>,
    scheduler: BatchLookupScheduler<K, V>,
    idle_ttl: Duration,
    diagnostics: SharedDiagnostics,
    commands: mpsc::WeakUnboundedSender<Command<K, V>>,
    next_epoch: u64,
    next_timer_token: u64,
}

impl<K: EntityKey, V: EntityValue> CacheActor<K, V> {
    pub fn new(
        source: Arc<dyn EntitySource<K, V>>,
        scheduler: BatchLookupScheduler<K, V>,
        idle_ttl: Duration,
        diagnostics: SharedDiagnostics,
        commands: mpsc::WeakUnboundedSender<Command<K, V>>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            groups: HashMap::new(),
            source,
            scheduler,
            idle_ttl,
            diagnostics,
            commands,
            next_epoch: 0,
            next_timer_token: 0,
        }
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<K, V>>) {
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.teardown_all();
        debug!("Keyed entity cache stopped");
    }

    fn handle(&mut self, command: Command<K, V>) -> bool {
        match command {
            Command::Subscribe { id, key, listener } => self.subscribe(id, key, listener),
            Command::Unsubscribe { id, key } => self.unsubscribe(id, &key),
            Command::SubscribeGroup { id, keys, listener } => {
                self.subscribe_group(id, keys, listener)
            }
            Command::UnsubscribeGroup { id } => self.unsubscribe_group(id),
            Command::Prime { key, value } => self.prime(key, value),
            Command::Resolved {
                key,
                epoch,
                origin,
                result,
            } => self.resolved(key, epoch, origin, result),
            Command::BatchResolved { epochs, results } => self.batch_resolved(epochs, results),
            Command::IdleExpired { key, token } => self.idle_expired(&key, token),
            Command::Peek { key, reply } => {
                let value = self
                    .entries
                    .get(&key)
                    .and_then(CacheEntry::value)
                    .cloned()
                    .flatten();
                let _ = reply.send(value);
            }
            Command::RefCount { key, reply } => {
                let refs = self.entries.get(&key).map_or(0, CacheEntry::ref_count);
                let _ = reply.send(refs);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => return false,
        }
        true
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    fn subscribe(&mut self, id: ListenerId, key: K, listener: Listener<V>) {
        let entry = self.entry_or_create(&key, true);
        entry.cancel_idle_timer();
        if let Some(value) = entry.value() {
            listener(value.clone());
        }
        entry.listeners.insert(id, listener);
    }

    fn unsubscribe(&mut self, id: ListenerId, key: &K) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.listeners.remove(&id).is_some() && entry.ref_count() == 0 {
            self.start_idle_timer(key);
        }
    }

    fn subscribe_group(&mut self, id: GroupId, keys: Vec<K>, listener: GroupListener<K, V>) {
        let mut seen = HashSet::with_capacity(keys.len());
        let keys: Vec<K> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();

        let mut to_prime = Vec::new();
        for key in &keys {
            let entry = self.entry_or_create(key, false);
            entry.cancel_idle_timer();
            entry.groups.insert(id);
            if !entry.is_loaded() && !entry.prime_in_flight {
                entry.prime_in_flight = true;
                to_prime.push((key.clone(), entry.epoch));
            }
        }
        self.groups.insert(id, Group { keys, listener });

        if !to_prime.is_empty() {
            self.spawn_batch_prime(to_prime);
        }
        self.emit_group(id);
    }

    fn unsubscribe_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.remove(&id) else {
            return;
        };
        for key in &group.keys {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            if entry.groups.remove(&id) && entry.ref_count() == 0 {
                self.start_idle_timer(key);
            }
        }
    }

    fn prime(&mut self, key: K, value: V) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        entry.primed_locally = true;
        if entry.apply(Some(value)) == Applied::Changed {
            self.notify(&[key]);
        }
    }

    // ========================================================================
    // FETCH RESULTS
    // ========================================================================

    fn resolved(&mut self, key: K, epoch: u64, origin: FetchOrigin, result: StoreResult<Option<V>>) {
        let Some(entry) = self.entries.get_mut(&key).filter(|e| e.epoch == epoch) else {
            self.diagnostics.emit(Diagnostic::LateResultDropped {
                key: format!("{:?}", key),
            });
            return;
        };

        if origin == FetchOrigin::PointLookup {
            entry.prime_in_flight = false;
            if entry.prime_superseded() {
                debug!(key = ?key, "Point lookup superseded");
                return;
            }
        }

        let applied = match result {
            Ok(value) => {
                if origin == FetchOrigin::LiveFeed {
                    entry.live_reported = true;
                }
                entry.apply(value)
            }
            Err(error) => {
                self.diagnostics.emit(Diagnostic::FetchFailed {
                    origin,
                    key: format!("{:?}", key),
                    error,
                });
                entry.apply_failure()
            }
        };

        if applied == Applied::Changed {
            self.notify(&[key]);
        }
    }

    fn batch_resolved(&mut self, epochs: Vec<(K, u64)>, mut results: HashMap<K, Lookup<V>>) {
        let mut changed = Vec::new();
        for (key, epoch) in epochs {
            let Some(entry) = self.entries.get_mut(&key).filter(|e| e.epoch == epoch) else {
                self.diagnostics.emit(Diagnostic::LateResultDropped {
                    key: format!("{:?}", key),
                });
                continue;
            };
            entry.prime_in_flight = false;
            if entry.prime_superseded() {
                continue;
            }
            let value = results.remove(&key).and_then(Lookup::into_option);
            if entry.apply(value) == Applied::Changed {
                changed.push(key);
            }
        }
        self.notify(&changed);
    }

    /// Deliver the current value of each key to its listeners, then each
    /// affected group once.
    fn notify(&self, keys: &[K]) {
        let mut groups = HashSet::new();
        for key in keys {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            let Some(value) = entry.value() else {
                continue;
            };
            for listener in entry.listeners.values() {
                listener(value.clone());
            }
            groups.extend(entry.groups.iter().copied());
        }
        for id in groups {
            self.emit_group(id);
        }
    }

    /// A group reports only once every constituent has resolved.
    fn emit_group(&self, id: GroupId) {
        let Some(group) = self.groups.get(&id) else {
            return;
        };
        let mut values = HashMap::with_capacity(group.keys.len());
        for key in &group.keys {
            match self.entries.get(key).and_then(CacheEntry::value) {
                Some(value) => {
                    values.insert(key.clone(), value.clone());
                }
                None => return,
            }
        }
        (group.listener)(values);
    }

    // ========================================================================
    // ENTRY LIFECYCLE
    // ========================================================================

    fn entry_or_create(&mut self, key: &K, point_fetch: bool) -> &mut CacheEntry<V> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let epoch = self.next_epoch;
                self.next_epoch += 1;

                let mut entry = CacheEntry::new(epoch);
                entry.live = Some(open_watch(self.source.as_ref(), &self.commands, key, epoch));
                if point_fetch {
                    entry.prime_in_flight = true;
                    spawn_point_fetch(Arc::clone(&self.source), self.commands.clone(), key.clone(), epoch);
                }
                debug!(key = ?key, epoch, "Cache entry created");
                vacant.insert(entry)
            }
        }
    }

    fn start_idle_timer(&mut self, key: &K) {
        let token = self.next_timer_token;
        self.next_timer_token += 1;

        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        entry.cancel_idle_timer();

        let weak = self.commands.clone();
        let ttl = self.idle_ttl;
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::IdleExpired {
                    key: timer_key,
                    token,
                });
            }
        });
        entry.idle_timer = Some(IdleTimer { token, handle });
    }

    fn idle_expired(&mut self, key: &K, token: u64) {
        let expired = self.entries.get(key).is_some_and(|entry| {
            entry.ref_count() == 0
                && entry.idle_timer.as_ref().is_some_and(|t| t.token == token)
        });
        if !expired {
            return;
        }
        if let Some(mut entry) = self.entries.remove(key) {
            entry.idle_timer = None;
            entry.teardown();
            debug!(key = ?key, "Idle TTL elapsed, live subscription closed");
        }
    }

    fn spawn_batch_prime(&self, epochs: Vec<(K, u64)>) {
        let scheduler = self.scheduler.clone();
        let weak = self.commands.clone();
        tokio::spawn(async move {
            let keys: Vec<K> = epochs.iter().map(|(key, _)| key.clone()).collect();
            let results = scheduler.lookup(&keys).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::BatchResolved { epochs, results });
            }
        });
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            live_subscriptions: self.entries.values().filter(|e| e.live.is_some()).count(),
            idle_timers: self
                .entries
                .values()
                .filter(|e| e.idle_timer.is_some())
                .count(),
            groups: self.groups.len(),
        }
    }

    fn teardown_all(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.teardown();
        }
        self.groups.clear();
    }
}

fn open_watch<K: EntityKey, V: EntityValue>(
    source: &dyn EntitySource<K, V>,
    commands: &mpsc::WeakUnboundedSender<Command<K, V>>,
    key: &K,
    epoch: u64,
) -> Subscription {
    let weak = commands.clone();
    let watched = key.clone();
    source.watch(
        key,
        Arc::new(move |result: StoreResult<Option<V>>| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::Resolved {
                    key: watched.clone(),
                    epoch,
                    origin: FetchOrigin::LiveFeed,
                    result,
                });
            }
        }),
    )
}

fn spawn_point_fetch<K: EntityKey, V: EntityValue>(
    source: Arc<dyn EntitySource<K, V>>,
    commands: mpsc::WeakUnboundedSender<Command<K, V>>,
    key: K,
    epoch: u64,
) {
    tokio::spawn(async move {
        let result = source.point_lookup(&key).await.map(Lookup::into_option);
        if let Some(tx) = commands.upgrade() {
            let _ = tx.send(Command::Resolved {
                key,
                epoch,
                origin: FetchOrigin::PointLookup,
                result,
            });
        }
    });
}
