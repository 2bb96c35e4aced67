//! FEEDSYNC Core - Shared Types
//!
//! Record types, ids, the subscription handle, the error taxonomy,
//! configuration, and diagnostics. Every other crate depends on this one;
//! it holds no synchronization logic of its own.

use std::fmt::Debug;
use std::hash::Hash;

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod identity;
pub mod records;
pub mod subscription;
pub mod time;

pub use config::{
    SyncConfig, DEFAULT_BATCH_LIMIT, DEFAULT_IDLE_TTL, DEFAULT_PATCH_WATCHDOG,
    DEFAULT_WRITE_TIMEOUT,
};
pub use diagnostics::{
    tracing_diagnostics, Diagnostic, DiagnosticSink, FetchOrigin, NoopDiagnostics,
    SharedDiagnostics, TracingDiagnostics,
};
pub use error::{
    ConfigError, MutationError, ParseError, SchemaError, StoreError, StoreResult, SyncError,
    SyncResult, WriteError,
};
pub use filter::{compare_values, FilterExpr, FilterOperator, OrderBy, QueryFilter, SortDirection};
pub use identity::{
    MessageId, ParticipantId, PostId, ReplyId, Timestamp, TournamentId, UserId,
};
pub use records::{
    Decode, Document, Participant, Post, ProfileSummary, Reply, TournamentMessage,
};
pub use subscription::Subscription;
pub use time::parse_timestamp;

// ============================================================================
// ENTITY TRAITS
// ============================================================================

/// Identity of a keyed entity or record.
pub trait EntityKey: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

impl<T> EntityKey for T where T: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

/// A small value object addressed by an [`EntityKey`].
///
/// `PartialEq` is the shallow equality the cache uses to suppress
/// redundant deliveries.
pub trait EntityValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> EntityValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// An element of a primary collection, identified by its own id.
pub trait Record: EntityValue {
    type Id: EntityKey;

    fn record_id(&self) -> Self::Id;
}

// ============================================================================
// LOOKUP RESULT
// ============================================================================

/// Result of a point or batch lookup.
///
/// `NotFound` is a confirmed terminal state, distinct from "not loaded yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Found(V),
    NotFound,
}

impl<V> Lookup<V> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn as_option(&self) -> Option<&V> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn into_option(self) -> Option<V> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }
}

impl<V> From<Option<V>> for Lookup<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_option_conversions() {
        let found: Lookup<u8> = Some(3).into();
        assert!(found.is_found());
        assert_eq!(found.as_option(), Some(&3));
        assert_eq!(found.into_option(), Some(3));

        let missing: Lookup<u8> = None.into();
        assert!(!missing.is_found());
        assert_eq!(missing.into_option(), None);
    }
}
