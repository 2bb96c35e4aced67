//! Local-first mutations with rollback on write failure.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use feedsync_core::{
    Diagnostic, MutationError, Record, SharedDiagnostics, SyncConfig, SyncError, SyncResult,
    WriteError,
};
use feedsync_store::{Mutation, MutationSink};
use tracing::{debug, warn};

use super::patch::{OptimisticPatch, Patch, PatchOp, PatchState, PatchTarget};

/// Applies patches ahead of backend acknowledgment and reconciles them
/// with the write outcome.
pub struct OptimisticMutationCoordinator {
    write_timeout: Duration,
    patch_watchdog: Duration,
    diagnostics: SharedDiagnostics,
    next_patch_id: AtomicU64,
}

impl OptimisticMutationCoordinator {
    pub fn new(config: &SyncConfig, diagnostics: SharedDiagnostics) -> Self {
        Self {
            write_timeout: config.write_timeout,
            patch_watchdog: config.patch_watchdog,
            diagnostics,
            next_patch_id: AtomicU64::new(1),
        }
    }

    /// Apply `patch` to `target`, then run `write`.
    ///
    /// `target` has already emitted the patched state when the write starts.
    /// If the write fails or outlives the configured timeout, the patch is
    /// rolled back (emitted again) and the error returned.
    pub async fn mutate<T, P, Fut, W>(
        &self,
        target: &Arc<P>,
        id: T::Id,
        patch: Patch<T>,
        write: Fut,
    ) -> SyncResult<()>
    where
        T: Record,
        P: PatchTarget<T> + ?Sized + 'static,
        Fut: Future<Output = Result<W, WriteError>> + Send + 'static,
        W: Send + 'static,
    {
        self.mutate_with(target, id, patch, self.write_timeout, move |_| write)
            .await
    }

    /// [`mutate`](Self::mutate) with a caller-supplied timeout and a write
    /// built from the resolved forward op.
    pub async fn mutate_with<T, P, F, Fut, W>(
        &self,
        target: &Arc<P>,
        id: T::Id,
        patch: Patch<T>,
        timeout: Duration,
        write: F,
    ) -> SyncResult<()>
    where
        T: Record,
        P: PatchTarget<T> + ?Sized + 'static,
        F: FnOnce(&PatchOp<T>) -> Fut,
        Fut: Future<Output = Result<W, WriteError>> + Send + 'static,
        W: Send + 'static,
    {
        let mut patch = self.resolve(&**target, id, patch)?;
        target.apply(&patch);
        debug!(patch_id = patch.id, record = ?patch.record_id(), "Optimistic patch applied");

        let mut handle = tokio::spawn(write(&patch.forward));
        let waited = tokio::time::timeout(timeout, &mut handle).await;
        let outcome = match waited {
            Ok(Ok(result)) => result.map(|_| ()),
            Ok(Err(join_error)) => Err(WriteError::Rejected {
                reason: join_error.to_string(),
            }),
            Err(_) => {
                self.detach_late_write(patch.id, handle);
                Err(WriteError::TimedOut { elapsed: timeout })
            }
        };

        match outcome {
            Ok(()) => {
                patch.state = PatchState::Confirmed;
                target.confirm(patch.id);
                self.spawn_watchdog::<T, P>(Arc::downgrade(target), patch.id);
                Ok(())
            }
            Err(error) => {
                patch.state = PatchState::Failed;
                warn!(patch_id = patch.id, error = %error, "Write failed, rolling back");
                target.rollback(&patch);
                Err(SyncError::from(error))
            }
        }
    }

    /// Mutate `target` and write the resolved op to `sink`.
    pub async fn mutate_through<T, P>(
        &self,
        target: &Arc<P>,
        sink: Arc<dyn MutationSink<T>>,
        collection: &str,
        id: T::Id,
        patch: Patch<T>,
    ) -> SyncResult<()>
    where
        T: Record,
        P: PatchTarget<T> + ?Sized + 'static,
    {
        let collection = collection.to_string();
        self.mutate_with(target, id, patch, self.write_timeout, move |op| {
            let mutation = match op {
                PatchOp::Upsert(record) => Mutation::Upsert {
                    collection,
                    record: record.clone(),
                },
                PatchOp::Remove(id) => Mutation::Delete {
                    collection,
                    id: id.clone(),
                },
            };
            async move { sink.write(mutation).await }
        })
        .await
    }

    /// Turn a caller patch into forward and reverse ops against the
    /// target's current record.
    fn resolve<T, P>(&self, target: &P, id: T::Id, patch: Patch<T>) -> SyncResult<OptimisticPatch<T>>
    where
        T: Record,
        P: PatchTarget<T> + ?Sized,
    {
        let current = target.current(&id);
        let restore = |current: Option<T>, id: T::Id| match current {
            Some(record) => PatchOp::Upsert(record),
            None => PatchOp::Remove(id),
        };
        let (forward, reverse) = match patch {
            Patch::Upsert(record) => {
                let actual = record.record_id();
                if actual != id {
                    return Err(MutationError::IdMismatch {
                        expected: format!("{:?}", id),
                        actual: format!("{:?}", actual),
                    }
                    .into());
                }
                (PatchOp::Upsert(record), restore(current, id))
            }
            Patch::Update(update) => {
                let Some(record) = current else {
                    return Err(MutationError::UnknownRecord {
                        id: format!("{:?}", id),
                    }
                    .into());
                };
                (PatchOp::Upsert(update(&record)), PatchOp::Upsert(record))
            }
            Patch::Remove => (PatchOp::Remove(id.clone()), restore(current, id)),
        };
        Ok(OptimisticPatch {
            id: self.next_patch_id.fetch_add(1, Ordering::Relaxed),
            forward,
            reverse,
            state: PatchState::Pending,
        })
    }

    fn detach_late_write<W: Send + 'static>(
        &self,
        patch_id: u64,
        handle: tokio::task::JoinHandle<Result<W, WriteError>>,
    ) {
        let diagnostics = Arc::clone(&self.diagnostics);
        tokio::spawn(async move {
            let succeeded = matches!(handle.await, Ok(Ok(_)));
            diagnostics.emit(Diagnostic::LateWriteOutcome {
                patch_id,
                succeeded,
            });
        });
    }

    fn spawn_watchdog<T, P>(&self, target: std::sync::Weak<P>, patch_id: u64)
    where
        T: Record,
        P: PatchTarget<T> + ?Sized + 'static,
    {
        let diagnostics = Arc::clone(&self.diagnostics);
        let watchdog = self.patch_watchdog;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            let Some(target) = target.upgrade() else {
                return;
            };
            if !target.is_pending(patch_id) {
                return;
            }
            if let Err(error) = target.refresh().await {
                warn!(patch_id, error = %error, "Corrective refresh failed");
            }
            if target.expire(patch_id) {
                diagnostics.emit(Diagnostic::PatchExpired { patch_id });
            }
        });
    }
}
