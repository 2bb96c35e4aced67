//! Optimistic (local-first) mutations.
//!
//! A mutation is resolved against a [`PatchTarget`]'s current record into a
//! forward op and the reverse op that undoes it. The forward op is applied
//! and emitted before the remote write is issued; a failed or timed-out
//! write applies the reverse. A successful write leaves the patch in place
//! until the authoritative feed echoes it, bounded by a watchdog that
//! forces a corrective refresh.

mod coordinator;
mod local;
mod patch;

pub use coordinator::OptimisticMutationCoordinator;
pub use local::LocalCollection;
pub use patch::{
    Comparator, OptimisticPatch, Patch, PatchId, PatchOp, PatchState, PatchTarget,
};
