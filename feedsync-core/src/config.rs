//! Synchronization layer configuration
//!
//! Configuration is loaded from environment variables with defaults that
//! match a Firestore-style backend (10 ids per `in` query).

use crate::ConfigError;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default idle TTL before an unused cache entry's live subscription closes.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60);

/// Default per-request id-count limit for batch lookups and `in` filters.
pub const DEFAULT_BATCH_LIMIT: usize = 10;

/// Default timeout applied to remote writes when the caller supplies none.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a confirmed optimistic patch awaiting its feed echo.
pub const DEFAULT_PATCH_WATCHDOG: Duration = Duration::from_secs(30);

/// Configuration for the cache, scheduler, merger, and mutation coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Grace period an entry stays warm after its last listener leaves.
    pub idle_ttl: Duration,

    /// Maximum ids per batch lookup or `in` filter.
    pub batch_limit: usize,

    /// Timeout for remote writes issued by the mutation coordinator.
    pub write_timeout: Duration,

    /// How long a confirmed patch may wait for its feed echo before a
    /// corrective fetch replaces it.
    pub patch_watchdog: Duration,

    /// Optional cap on combined views produced by chunked subscriptions.
    pub max_merged_items: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_ttl: DEFAULT_IDLE_TTL,
            batch_limit: DEFAULT_BATCH_LIMIT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            patch_watchdog: DEFAULT_PATCH_WATCHDOG,
            max_merged_items: None,
        }
    }
}

impl SyncConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle TTL.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Set the batch limit.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the patch watchdog.
    pub fn with_patch_watchdog(mut self, watchdog: Duration) -> Self {
        self.patch_watchdog = watchdog;
        self
    }

    /// Cap combined chunked views at `max` items.
    pub fn with_max_merged_items(mut self, max: usize) -> Self {
        self.max_merged_items = Some(max);
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `FEEDSYNC_IDLE_TTL_MS`: idle TTL in milliseconds (default: 60000)
    /// - `FEEDSYNC_BATCH_LIMIT`: ids per batch request (default: 10)
    /// - `FEEDSYNC_WRITE_TIMEOUT_MS`: remote write timeout (default: 10000)
    /// - `FEEDSYNC_PATCH_WATCHDOG_MS`: optimistic patch lifetime (default: 30000)
    /// - `FEEDSYNC_MAX_MERGED_ITEMS`: cap for chunked views (default: unset)
    ///
    /// Unparseable values are logged and fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |name: &str, default: Duration| {
            parse_var::<u64, _>(&lookup, name)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        let batch_limit =
            parse_var(&lookup, "FEEDSYNC_BATCH_LIMIT").unwrap_or(DEFAULT_BATCH_LIMIT);
        let max_merged_items = parse_var(&lookup, "FEEDSYNC_MAX_MERGED_ITEMS");

        Self {
            idle_ttl: millis("FEEDSYNC_IDLE_TTL_MS", DEFAULT_IDLE_TTL),
            batch_limit,
            write_timeout: millis("FEEDSYNC_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT),
            patch_watchdog: millis("FEEDSYNC_PATCH_WATCHDOG_MS", DEFAULT_PATCH_WATCHDOG),
            max_merged_items,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_limit".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "write_timeout".to_string(),
                value: format!("{:?}", self.write_timeout),
                reason: "must be positive".to_string(),
            });
        }
        if self.patch_watchdog < self.write_timeout {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "patch_watchdog".to_string(),
                option_b: "write_timeout".to_string(),
            });
        }
        if self.max_merged_items == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "max_merged_items".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparsable config value");
            None
        }
    }
}
