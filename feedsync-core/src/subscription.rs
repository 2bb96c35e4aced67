//! Subscription handles
//!
//! Every subscribe call in the workspace returns a [`Subscription`]. The
//! handle owns a teardown closure that runs at most once, either through an
//! explicit [`Subscription::unsubscribe`] or when the handle is dropped.

use std::fmt;
use std::sync::Mutex;

type Teardown = Box<dyn FnOnce() + Send>;

/// Handle to a live subscription.
///
/// Unsubscribing is idempotent: calling [`unsubscribe`](Self::unsubscribe)
/// twice, or after the underlying resource is gone, is a no-op.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    teardown: Mutex<Option<Teardown>>,
}

impl Subscription {
    /// Wrap a teardown closure.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            teardown: Mutex::new(None),
        }
    }

    /// Fold several handles into one that tears all of them down.
    pub fn combine(parts: Vec<Subscription>) -> Self {
        Self::new(move || {
            for part in parts {
                part.unsubscribe();
            }
        })
    }

    /// Run the teardown if it has not run yet.
    pub fn unsubscribe(&self) {
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// Whether the teardown is still outstanding.
    pub fn is_active(&self) -> bool {
        self.teardown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
