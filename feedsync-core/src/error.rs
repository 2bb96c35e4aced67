//! Error types for FEEDSYNC operations
//!
//! Read-path failures (`StoreError`) never reach listeners; the cache and
//! merger log them and fall back to "value absent". Write-path failures
//! (`WriteError`) always propagate to the caller of `mutate`.

use std::time::Duration;
use thiserror::Error;

/// Backing-store read errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Backing store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Permission denied reading {resource}")]
    PermissionDenied { resource: String },

    #[error("Backend error: {reason}")]
    Backend { reason: String },

    #[error("Batch of {requested} ids exceeds backend limit of {limit}")]
    BatchTooLarge { requested: usize, limit: usize },
}

/// Remote write errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("Write conflict on {document}: {reason}")]
    Conflict { document: String, reason: String },

    #[error("Write rejected: {reason}")]
    Rejected { reason: String },

    #[error("Write timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },
}

/// Timestamp parsing errors at the backing-store boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid timestamp string {raw:?}: {reason}")]
    InvalidString { raw: String, reason: String },

    #[error("Timestamp out of range: {raw}")]
    OutOfRange { raw: String },

    #[error("Unsupported timestamp shape: {shape}")]
    UnsupportedShape { shape: String },
}

/// Document schema validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Required field missing on {kind} {id}: {field}")]
    RequiredFieldMissing {
        kind: &'static str,
        id: String,
        field: String,
    },

    #[error("Invalid value for {field} on {kind} {id}: {reason}")]
    InvalidValue {
        kind: &'static str,
        id: String,
        field: String,
        reason: String,
    },

    #[error("Invalid timestamp in {field}: {source}")]
    Timestamp {
        field: String,
        #[source]
        source: ParseError,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Optimistic mutation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Cannot update unknown record {id}")]
    UnknownRecord { id: String },

    #[error("Upsert addressed to {expected} carries record {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Remote write failed, local state rolled back: {0}")]
    Write(#[from] WriteError),
}

/// Master error type for all FEEDSYNC errors.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache instance has shut down")]
    CacheClosed,
}

impl From<WriteError> for SyncError {
    fn from(err: WriteError) -> Self {
        SyncError::Mutation(MutationError::Write(err))
    }
}

impl SyncError {
    /// The underlying write error, if this error came from a rolled-back write.
    pub fn write_error(&self) -> Option<&WriteError> {
        match self {
            SyncError::Mutation(MutationError::Write(err)) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for read-path backing-store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for FEEDSYNC operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================
