use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use tokio::runtime::Handle;
use tonic::Status;

use super::mutation::MutateRowsEntry;

/// A row in a bulk apply that Bigtable didn't write.
#[derive(Clone, Debug)]
pub struct FailedMutation {
    /// Position of the row in the request's entries.
    pub index: usize,
    pub status: Status,
}

impl FailedMutation {
    pub fn new(index: usize, status: Status) -> Self {
        Self { index, status }
    }
}

/// Writes many rows to one table in a single request, like Bigtable's
/// `MutateRows` RPC.
///
/// `Ok` with no failures means every row was written. `Ok` with failures
/// lists the rows that weren't, by position. `Err` means the request as a
/// whole failed and none of the rows should be assumed written.
///
/// Implementations own any retry policy. The [`MutationBatcher`] reports
/// whatever this returns without retrying.
///
/// [`MutationBatcher`]: crate::batcher::MutationBatcher
#[async_trait]
pub trait BulkApply: Send + Sync + 'static {
    async fn bulk_apply(
        &self,
        table: &str,
        entries: Vec<MutateRowsEntry>,
    ) -> Result<Vec<FailedMutation>, Status>;
}

/// Runs background work, such as waiting on a bulk apply and handling its
/// result.
pub trait Scheduler: Send + Sync {
    fn run_async(&self, task: BoxFuture<'static, ()>);
}

/// Spawns tasks onto a Tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler(Handle);

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self(handle)
    }

    /// Uses the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self(Handle::current())
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}

impl Scheduler for TokioScheduler {
    fn run_async(&self, task: BoxFuture<'static, ()>) {
        // The batcher learns of the result through the task itself, so the
        // join handle isn't needed.
        drop(self.0.spawn(task));
    }
}
