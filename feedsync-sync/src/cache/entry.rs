//! Per-key cache entry state, owned by the cache actor.

use std::collections::{HashMap, HashSet};

use feedsync_core::Subscription;
use tokio::task::JoinHandle;

use super::{GroupId, Listener, ListenerId};

/// Whether an entry has resolved at least once.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EntryData<V> {
    Unloaded,
    Loaded(Option<V>),
}

/// Outcome of applying a resolved value to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    /// The cached value changed (or resolved for the first time).
    Changed,
    /// Shallow-equal to the cached value.
    Unchanged,
}

pub(crate) struct IdleTimer {
    pub token: u64,
    pub handle: JoinHandle<()>,
}

impl IdleTimer {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

pub(crate) struct CacheEntry<V> {
    /// Distinguishes this incarnation from earlier ones for the same key.
    pub epoch: u64,
    pub data: EntryData<V>,
    pub listeners: HashMap<ListenerId, Listener<V>>,
    pub groups: HashSet<GroupId>,
    pub live: Option<Subscription>,
    pub idle_timer: Option<IdleTimer>,
    /// A point or batch prime is outstanding.
    pub prime_in_flight: bool,
    /// The live feed has delivered; later prime results are stale.
    pub live_reported: bool,
    /// A local prime landed; outstanding prime results are stale.
    pub primed_locally: bool,
}

impl<V: PartialEq + Clone> CacheEntry<V> {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            data: EntryData::Unloaded,
            listeners: HashMap::new(),
            groups: HashSet::new(),
            live: None,
            idle_timer: None,
            prime_in_flight: false,
            live_reported: false,
            primed_locally: false,
        }
    }

    /// One ref per point listener and one per group registration.
    pub fn ref_count(&self) -> usize {
        self.listeners.len() + self.groups.len()
    }

    /// Whether a point or batch prime result would replace fresher data.
    pub fn prime_superseded(&self) -> bool {
        self.live_reported || self.primed_locally
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.data, EntryData::Loaded(_))
    }

    pub fn value(&self) -> Option<&Option<V>> {
        match &self.data {
            EntryData::Loaded(value) => Some(value),
            EntryData::Unloaded => None,
        }
    }

    /// Store `value`, reporting whether listeners must hear about it.
    pub fn apply(&mut self, value: Option<V>) -> Applied {
        match &self.data {
            EntryData::Loaded(current) if *current == value => Applied::Unchanged,
            _ => {
                self.data = EntryData::Loaded(value);
                Applied::Changed
            }
        }
    }

    /// Resolve an unloaded entry as absent after a failed fetch. A loaded
    /// value is never overwritten by an error.
    pub fn apply_failure(&mut self) -> Applied {
        if self.is_loaded() {
            Applied::Unchanged
        } else {
            self.data = EntryData::Loaded(None);
            Applied::Changed
        }
    }

    pub fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    /// Close the live subscription and any pending timer.
    pub fn teardown(&mut self) {
        self.cancel_idle_timer();
        if let Some(live) = self.live.take() {
            live.unsubscribe();
        }
    }
}
