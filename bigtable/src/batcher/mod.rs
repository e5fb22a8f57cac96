//! Groups single-row mutations into `MutateRows` batches.
//!
//! The [`MutationBatcher`] bounds the work it has in flight in several ways at
//! once: mutations and bytes per batch, concurrent batches, and mutations and
//! bytes across all batches. Each call to [`MutationBatcher::apply`] returns
//! two futures:
//! - [`Admission`] resolves once the row is part of a batch that has been
//!   sent. Callers that produce rows faster than Bigtable can take them should
//!   wait on this before submitting more.
//! - [`Completion`] resolves with the row's outcome once the batch's bulk
//!   apply returns.
//!
//! Rows wait for room in strict submission order.
use futures::channel::oneshot;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::Status;
use tracing::{debug, instrument, trace, warn};

use crate::bulk::{BulkApply, FailedMutation, Scheduler};
use crate::mutation::{MutateRowsEntry, SingleRowMutation};
use observability::metrics;
use observability::metrics_tag as tag;
use state::{demultiplex, Batch, InFlight, PendingMutation, State};

mod options;
mod state;

pub use options::{Options, BIGTABLE_MUTATION_LIMIT, BIGTABLE_OUTSTANDING_MUTATION_LIMIT};
pub use state::BatcherStats;

/// Why a row was rejected without being sent.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum InvalidMutation {
    #[error("SingleRowMutation has no mutations")]
    Empty,

    #[error("too many mutations in a SingleRowMutation: {count} exceeds the limit of {limit}")]
    TooManyMutations { count: usize, limit: usize },

    #[error("SingleRowMutation is too large: {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

impl InvalidMutation {
    fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::TooManyMutations { .. } => "too_many_mutations",
            Self::TooLarge { .. } => "too_large",
        }
    }
}

impl From<InvalidMutation> for Status {
    fn from(error: InvalidMutation) -> Self {
        Status::invalid_argument(error.to_string())
    }
}

/// Checks the limits that no amount of waiting would let a row meet.
fn validate(options: &Options, num_mutations: usize, size: usize) -> Result<(), InvalidMutation> {
    if num_mutations == 0 {
        return Err(InvalidMutation::Empty);
    }
    let limit = options.row_mutation_limit();
    if num_mutations > limit {
        return Err(InvalidMutation::TooManyMutations {
            count: num_mutations,
            limit,
        });
    }
    let limit = options.row_size_limit();
    if size > limit {
        return Err(InvalidMutation::TooLarge { size, limit });
    }
    Ok(())
}

/// Resolves once a row has been sent as part of a batch, or has been
/// rejected.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Admission(oneshot::Receiver<()>);

impl Future for Admission {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender means the row left the batcher some other way
        // (rejected, or its task was dropped). Either way it's no longer
        // waiting for admission.
        self.0.poll_unpin(cx).map(|_| ())
    }
}

/// Resolves with the outcome of writing a row.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Completion(oneshot::Receiver<Result<(), Status>>);

impl Future for Completion {
    type Output = Result<(), Status>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx).map(|result| match result {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(Status::cancelled(
                "bulk apply task was dropped before reporting a result",
            )),
        })
    }
}

/// Resolves when the batcher has nothing outstanding or pending.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct NoPendingRequests(oneshot::Receiver<()>);

impl Future for NoPendingRequests {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.poll_unpin(cx).map(|_| ())
    }
}

/// Batches [`SingleRowMutation`]s for one table into bulk applies.
///
/// Cloning is cheap and clones share the same batches and limits.
#[derive(Clone)]
pub struct MutationBatcher(Arc<BatcherInner>);

struct BatcherInner {
    table: String,
    bulk_apply: Arc<dyn BulkApply>,
    options: Options,
    metrics: metrics::Client,
    state: Mutex<State>,
}

impl std::fmt::Debug for MutationBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationBatcher")
            .field("table", &self.0.table)
            .field("options", &self.0.options)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MutationBatcher {
    /// `table` is the full table name, as in [`Instance::table_path`].
    ///
    /// [`Instance::table_path`]: crate::Instance::table_path
    pub fn new(
        table: impl Into<String>,
        bulk_apply: Arc<dyn BulkApply>,
        options: Options,
    ) -> Self {
        Self::with_metrics(table, bulk_apply, options, metrics::Client::NONE)
    }

    pub fn with_metrics(
        table: impl Into<String>,
        bulk_apply: Arc<dyn BulkApply>,
        options: Options,
        metrics: metrics::Client,
    ) -> Self {
        Self(Arc::new(BatcherInner {
            table: table.into(),
            bulk_apply,
            options,
            metrics,
            state: Mutex::new(State::default()),
        }))
    }

    pub fn table(&self) -> &str {
        &self.0.table
    }

    pub fn options(&self) -> &Options {
        &self.0.options
    }

    pub fn stats(&self) -> BatcherStats {
        self.0.state.lock().unwrap().stats()
    }

    /// Submits a row to be written. Doesn't block.
    ///
    /// A row with no mutations, or one that could never fit in a batch, fails
    /// right away with `InvalidArgument` and uses no batch capacity. Bulk
    /// applies and their result handling run on `scheduler`.
    pub fn apply(
        &self,
        scheduler: &Arc<dyn Scheduler>,
        mutation: SingleRowMutation,
    ) -> (Admission, Completion) {
        let (admission_tx, admission_rx) = oneshot::channel();
        let (completion_tx, completion_rx) = oneshot::channel();
        let futures = (Admission(admission_rx), Completion(completion_rx));

        let num_mutations = mutation.num_mutations();
        let size = mutation.wire_size();
        if let Err(error) = validate(&self.0.options, num_mutations, size) {
            debug!(
                table = %self.0.table,
                %error,
                row = ?mutation,
                "rejecting row mutation"
            );
            self.0
                .metrics
                .incr("bigtable.batcher.rejected", [tag!("reason": "{}", error.reason())]);
            let _ = admission_tx.send(());
            let _ = completion_tx.send(Err(Status::from(error)));
            return futures;
        }

        let (batches, pending) = {
            let mut locked = self.0.state.lock().unwrap();
            locked.enqueue(PendingMutation {
                entry: mutation.into_entry(),
                num_mutations,
                size,
                admission: admission_tx,
                completion: completion_tx,
            });
            let batches = locked.form_batches(&self.0.options);
            (batches, locked.stats().pending_mutations)
        };
        self.record_pending(pending);
        self.dispatch_all(scheduler, batches);
        futures
    }

    /// Returns a future that resolves once every submitted row has completed.
    ///
    /// It resolves immediately if nothing is outstanding or pending.
    /// Otherwise it resolves the next time that's the case.
    pub fn wait_for_no_pending_requests(&self) -> NoPendingRequests {
        let (tx, rx) = oneshot::channel();
        let already_idle = self.0.state.lock().unwrap().wait_for_idle(tx);
        if let Some(tx) = already_idle {
            let _ = tx.send(());
        }
        NoPendingRequests(rx)
    }

    /// Called with the lock released. Admissions are reported before each
    /// batch's bulk apply starts, so they always precede the completions.
    fn dispatch_all(&self, scheduler: &Arc<dyn Scheduler>, batches: Vec<Batch>) {
        for batch in batches {
            let (entries, admissions, in_flight) = batch.dispatch();
            for admission in admissions {
                let _ = admission.send(());
            }
            self.record_dispatch(&in_flight);

            let batcher = self.clone();
            let task = BatchTask {
                batcher: self.clone(),
                scheduler: Arc::clone(scheduler),
                num_mutations: in_flight.num_mutations,
                size: in_flight.size,
                in_flight: Some(in_flight),
            };
            scheduler.run_async(Box::pin(async move {
                batcher.run_batch(entries, task).await;
            }));
        }
    }

    #[instrument(
        level = "trace",
        skip(self, entries, task),
        fields(
            table = %self.0.table,
            num_rows = entries.len(),
            num_mutations = task.num_mutations,
            size = task.size,
        )
    )]
    async fn run_batch(&self, entries: Vec<MutateRowsEntry>, task: BatchTask) {
        let start = Instant::now();
        let result = self.0.bulk_apply.bulk_apply(&self.0.table, entries).await;
        self.record_result(&result, start);
        task.finish(result);
    }

    /// Reports each row's result, releases the batch's budget, and admits
    /// whatever now fits.
    fn finish_batch(
        &self,
        scheduler: &Arc<dyn Scheduler>,
        in_flight: InFlight,
        result: Result<Vec<FailedMutation>, Status>,
    ) {
        let InFlight {
            num_mutations,
            size,
            completions,
        } = in_flight;

        if let Err(status) = &result {
            warn!(
                table = %self.0.table,
                rows = completions.len(),
                code = ?status.code(),
                message = status.message(),
                "bulk apply failed"
            );
        }
        let (results, bad_indexes) = demultiplex(completions.len(), result);
        if !bad_indexes.is_empty() {
            warn!(
                table = %self.0.table,
                rows = completions.len(),
                ?bad_indexes,
                "bulk apply reported failures for rows that weren't in the request"
            );
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            self.0.metrics.count(
                "bigtable.batcher.failed_mutations",
                failed as i64,
                metrics::NO_TAGS,
            );
        }
        for (completion, result) in completions.into_iter().zip(results) {
            let _ = completion.send(result);
        }

        let (batches, idle_waiters, pending) = {
            let mut locked = self.0.state.lock().unwrap();
            locked.finish_batch(num_mutations, size);
            let batches = locked.form_batches(&self.0.options);
            let pending = locked.stats().pending_mutations;
            (batches, locked.take_idle_waiters(), pending)
        };
        self.record_pending(pending);
        trace!(
            next_batches = batches.len(),
            idle = !idle_waiters.is_empty(),
            "finished batch"
        );
        self.dispatch_all(scheduler, batches);
        for waiter in idle_waiters {
            let _ = waiter.send(());
        }
    }

    fn record_pending(&self, pending: usize) {
        self.0
            .metrics
            .gauge("bigtable.batcher.pending", pending, metrics::NO_TAGS);
    }

    fn record_dispatch(&self, in_flight: &InFlight) {
        let metrics = &self.0.metrics;
        metrics.distribution(
            "bigtable.batcher.batch.rows",
            in_flight.completions.len(),
            metrics::NO_TAGS,
        );
        metrics.distribution(
            "bigtable.batcher.batch.mutations",
            in_flight.num_mutations,
            metrics::NO_TAGS,
        );
        metrics.distribution(
            "bigtable.batcher.batch.bytes",
            in_flight.size,
            metrics::NO_TAGS,
        );
    }

    fn record_result(&self, result: &Result<Vec<FailedMutation>, Status>, start: Instant) {
        let outcome = match result {
            Ok(failures) if failures.is_empty() => "ok",
            Ok(_) => "partial",
            Err(_) => "error",
        };
        self.0.metrics.timing(
            "bigtable.batcher.bulk_apply.time",
            start.elapsed(),
            [tag!("result": "{outcome}")],
        );
    }
}

/// Owns a dispatched batch until its results are reported.
///
/// If the task running the bulk apply is dropped first (the bulk apply
/// panicked, or the scheduler discarded the task), dropping this fails the
/// batch's rows with `Cancelled` and releases its slot and budget.
struct BatchTask {
    batcher: MutationBatcher,
    scheduler: Arc<dyn Scheduler>,
    num_mutations: usize,
    size: usize,
    in_flight: Option<InFlight>,
}

impl BatchTask {
    fn finish(mut self, result: Result<Vec<FailedMutation>, Status>) {
        if let Some(in_flight) = self.in_flight.take() {
            self.batcher.finish_batch(&self.scheduler, in_flight, result);
        }
    }
}

impl Drop for BatchTask {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            warn!(
                table = %self.batcher.0.table,
                rows = in_flight.completions.len(),
                "bulk apply task ended without a result"
            );
            self.batcher.finish_batch(
                &self.scheduler,
                in_flight,
                Err(Status::cancelled(
                    "bulk apply task ended before reporting a result",
                )),
            );
        }
    }
}
