//! Diagnostics routing
//!
//! Read-path failures and lifecycle races are never surfaced to listeners.
//! They are reported as [`Diagnostic`] events to an injectable
//! [`DiagnosticSink`]; the default sink writes them to `tracing`.

use crate::StoreError;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which code path produced a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOrigin {
    /// One-shot point lookup priming a new cache entry.
    PointLookup,
    /// Live change subscription for a cache entry.
    LiveFeed,
    /// Primary collection stream of a merger.
    PrimaryStream,
    /// Corrective one-shot fetch after an optimistic patch expired.
    Refresh,
}

impl fmt::Display for FetchOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchOrigin::PointLookup => "point_lookup",
            FetchOrigin::LiveFeed => "live_feed",
            FetchOrigin::PrimaryStream => "primary_stream",
            FetchOrigin::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// A diagnostic event from the synchronization layer.
///
/// Keys are rendered with `Debug` so the sink stays untyped.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A fetch failed and was resolved as "value absent" or ignored.
    FetchFailed {
        origin: FetchOrigin,
        key: String,
        error: StoreError,
    },
    /// One chunk of a batch lookup failed; its ids were mapped to NotFound.
    PartialBatchFailure {
        chunk_index: usize,
        ids: Vec<String>,
        error: StoreError,
    },
    /// A merger replaced its enrichment subscription.
    Resubscribed {
        added: usize,
        removed: usize,
        total: usize,
    },
    /// An async result arrived for an entry that was torn down or replaced.
    LateResultDropped { key: String },
    /// A raw document failed schema validation and was skipped.
    DocumentRejected { id: String, reason: String },
    /// A write finished after its timeout had already rolled it back.
    LateWriteOutcome { patch_id: u64, succeeded: bool },
    /// A confirmed optimistic patch never saw its feed echo.
    PatchExpired { patch_id: u64 },
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Shared handle to a diagnostic sink.
pub type SharedDiagnostics = Arc<dyn DiagnosticSink>;

/// Sink that logs every diagnostic through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::FetchFailed { origin, key, error } => {
                warn!(origin = %origin, key = %key, error = %error, "Fetch failed, treating as absent");
            }
            Diagnostic::PartialBatchFailure {
                chunk_index,
                ids,
                error,
            } => {
                warn!(
                    chunk_index,
                    ids = ids.len(),
                    error = %error,
                    "Batch chunk failed, ids degraded to NotFound"
                );
            }
            Diagnostic::Resubscribed {
                added,
                removed,
                total,
            } => {
                debug!(added, removed, total, "Enrichment resubscribed");
            }
            Diagnostic::LateResultDropped { key } => {
                debug!(key = %key, "Dropped result for torn-down entry");
            }
            Diagnostic::DocumentRejected { id, reason } => {
                warn!(id = %id, reason = %reason, "Document failed schema validation");
            }
            Diagnostic::LateWriteOutcome {
                patch_id,
                succeeded,
            } => {
                warn!(patch_id, succeeded, "Write resolved after timeout");
            }
            Diagnostic::PatchExpired { patch_id } => {
                warn!(patch_id, "Optimistic patch expired without feed echo");
            }
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDiagnostics;

impl DiagnosticSink for NoopDiagnostics {
    fn emit(&self, _diagnostic: Diagnostic) {}
}

/// The default shared sink.
pub fn tracing_diagnostics() -> SharedDiagnostics {
    Arc::new(TracingDiagnostics)
}
