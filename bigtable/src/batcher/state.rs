use futures::channel::oneshot;
use std::collections::VecDeque;
use tonic::Status;

use super::options::Options;
use crate::bulk::FailedMutation;
use crate::mutation::MutateRowsEntry;

/// A row mutation that passed validation and is waiting for a batch slot or
/// is part of a dispatched batch.
#[derive(Debug)]
pub(super) struct PendingMutation {
    pub entry: MutateRowsEntry,
    pub num_mutations: usize,
    pub size: usize,
    pub admission: oneshot::Sender<()>,
    pub completion: oneshot::Sender<Result<(), Status>>,
}

/// Mutations admitted together into one bulk apply, in submission order.
#[derive(Debug, Default)]
pub(super) struct Batch {
    pub num_mutations: usize,
    pub size: usize,
    pub members: Vec<PendingMutation>,
}

impl Batch {
    fn push(&mut self, mutation: PendingMutation) {
        self.num_mutations += mutation.num_mutations;
        self.size += mutation.size;
        self.members.push(mutation);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Splits the batch into the request entries, the admission senders, and
    /// what's needed to report results once the bulk apply returns.
    pub(super) fn dispatch(self) -> (Vec<MutateRowsEntry>, Vec<oneshot::Sender<()>>, InFlight) {
        let mut entries = Vec::with_capacity(self.members.len());
        let mut admissions = Vec::with_capacity(self.members.len());
        let mut completions = Vec::with_capacity(self.members.len());
        for member in self.members {
            entries.push(member.entry);
            admissions.push(member.admission);
            completions.push(member.completion);
        }
        let in_flight = InFlight {
            num_mutations: self.num_mutations,
            size: self.size,
            completions,
        };
        (entries, admissions, in_flight)
    }
}

/// A dispatched batch. `completions[i]` belongs to the `i`th entry of the
/// request.
#[derive(Debug)]
pub(super) struct InFlight {
    pub num_mutations: usize,
    pub size: usize,
    pub completions: Vec<oneshot::Sender<Result<(), Status>>>,
}

/// Pairs each row in a finished batch with its outcome.
///
/// Failures name rows by position. A failure of the whole request applies to
/// every row. Returns the per-row results and any failure indexes that were
/// out of range.
pub(super) fn demultiplex(
    len: usize,
    result: Result<Vec<FailedMutation>, Status>,
) -> (Vec<Result<(), Status>>, Vec<usize>) {
    match result {
        Err(status) => (vec![Err(status); len], Vec::new()),
        Ok(failures) => {
            let mut results = vec![Ok(()); len];
            let mut bad_indexes = Vec::new();
            for failure in failures {
                match results.get_mut(failure.index) {
                    Some(slot) => *slot = Err(failure.status),
                    None => bad_indexes.push(failure.index),
                }
            }
            (results, bad_indexes)
        }
    }
}

/// The mutable state of a batcher, guarded by a single lock.
///
/// `outstanding_*` count admitted mutations whose completion isn't resolved
/// yet. Pending mutations aren't counted until they're admitted.
#[derive(Debug, Default)]
pub(super) struct State {
    pending: VecDeque<PendingMutation>,
    outstanding_mutations: usize,
    outstanding_size: usize,
    in_flight_batches: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl State {
    pub fn enqueue(&mut self, mutation: PendingMutation) {
        self.pending.push_back(mutation);
    }

    /// Moves pending mutations into new batches while there are free batch
    /// slots, strictly in submission order.
    ///
    /// A batch takes mutations from the front of the queue until the next
    /// one would exceed a per-batch or outstanding limit. Formation stops
    /// entirely when the front of the queue can't be admitted, even if later
    /// mutations would fit. The returned batches are counted as in flight
    /// and must be dispatched.
    pub fn form_batches(&mut self, options: &Options) -> Vec<Batch> {
        let mut batches = Vec::new();
        while self.in_flight_batches < options.max_batches() {
            let mut batch = Batch::default();
            while let Some(next) = self.pending.front() {
                if !self.has_room(options, &batch, next) {
                    break;
                }
                let Some(next) = self.pending.pop_front() else {
                    break;
                };
                self.outstanding_mutations += next.num_mutations;
                self.outstanding_size += next.size;
                batch.push(next);
            }
            if batch.is_empty() {
                break;
            }
            self.in_flight_batches += 1;
            batches.push(batch);
        }
        batches
    }

    fn has_room(&self, options: &Options, batch: &Batch, next: &PendingMutation) -> bool {
        batch.num_mutations + next.num_mutations <= options.max_mutations_per_batch()
            && batch.size + next.size <= options.max_size_per_batch()
            && self.outstanding_mutations + next.num_mutations
                <= options.max_outstanding_mutations()
            && self.outstanding_size + next.size <= options.max_outstanding_size()
    }

    /// Releases the budget held by a batch whose results have been reported.
    pub fn finish_batch(&mut self, num_mutations: usize, size: usize) {
        assert!(self.in_flight_batches > 0, "finished batch wasn't in flight");
        self.in_flight_batches -= 1;
        self.outstanding_mutations -= num_mutations;
        self.outstanding_size -= size;
    }

    /// True when nothing is outstanding or waiting to be admitted.
    pub fn is_idle(&self) -> bool {
        self.outstanding_mutations == 0 && self.pending.is_empty()
    }

    /// Registers a waiter for [`Self::is_idle`]. Returns the sender back if
    /// the batcher is already idle.
    pub fn wait_for_idle(&mut self, waiter: oneshot::Sender<()>) -> Option<oneshot::Sender<()>> {
        if self.is_idle() {
            Some(waiter)
        } else {
            self.idle_waiters.push(waiter);
            None
        }
    }

    /// Takes the registered waiters if the batcher has become idle.
    pub fn take_idle_waiters(&mut self) -> Vec<oneshot::Sender<()>> {
        if self.is_idle() {
            std::mem::take(&mut self.idle_waiters)
        } else {
            Vec::new()
        }
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            outstanding_mutations: self.outstanding_mutations,
            outstanding_size: self.outstanding_size,
            pending_mutations: self.pending.len(),
            in_flight_batches: self.in_flight_batches,
        }
    }
}

/// A point-in-time view of a [`MutationBatcher`](super::MutationBatcher).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatcherStats {
    /// Cell mutations admitted into batches and not yet completed.
    pub outstanding_mutations: usize,
    /// Bytes admitted into batches and not yet completed.
    pub outstanding_size: usize,
    /// Rows waiting for room in a batch.
    pub pending_mutations: usize,
    /// Bulk applies that have been started and not yet finished.
    pub in_flight_batches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(num_mutations: usize, size: usize) -> PendingMutation {
        let (admission, _) = oneshot::channel();
        let (completion, _) = oneshot::channel();
        PendingMutation {
            entry: MutateRowsEntry::default(),
            num_mutations,
            size,
            admission,
            completion,
        }
    }

    fn batch_shapes(batches: &[Batch]) -> Vec<(usize, usize, usize)> {
        batches
            .iter()
            .map(|b| (b.members.len(), b.num_mutations, b.size))
            .collect()
    }

    #[test]
    fn test_form_batches_respects_per_batch_limits() {
        let options = Options::new()
            .with_max_mutations_per_batch(5)
            .with_max_size_per_batch(100)
            .with_max_batches(10);
        let mut state = State::default();
        for (n, size) in [(2, 10), (2, 10), (2, 10), (1, 90), (1, 20)] {
            state.enqueue(pending(n, size));
        }
        let batches = state.form_batches(&options);
        // 2+2 fits, the third would be 6 mutations. Then 2+1 is 100 bytes, and
        // the last would be 120.
        assert_eq!(
            batch_shapes(&batches),
            vec![(2, 4, 20), (2, 3, 100), (1, 1, 20)]
        );
        assert_eq!(
            state.stats(),
            BatcherStats {
                outstanding_mutations: 8,
                outstanding_size: 140,
                pending_mutations: 0,
                in_flight_batches: 3,
            }
        );
    }

    #[test]
    fn test_form_batches_stops_at_max_batches() {
        let options = Options::new()
            .with_max_mutations_per_batch(1)
            .with_max_batches(2);
        let mut state = State::default();
        for _ in 0..3 {
            state.enqueue(pending(1, 1));
        }
        assert_eq!(state.form_batches(&options).len(), 2);
        assert_eq!(state.stats().pending_mutations, 1);
        assert!(state.form_batches(&options).is_empty());

        state.finish_batch(1, 1);
        assert_eq!(batch_shapes(&state.form_batches(&options)), vec![(1, 1, 1)]);
        assert_eq!(state.stats().in_flight_batches, 2);
        assert_eq!(state.stats().pending_mutations, 0);
    }

    #[test]
    fn test_form_batches_is_fifo() {
        let options = Options::new()
            .with_max_outstanding_mutations(10)
            .with_max_batches(4);
        let mut state = State::default();
        state.enqueue(pending(8, 1));
        assert_eq!(state.form_batches(&options).len(), 1);

        // The head needs 5 but only 2 are free. The small one behind it must
        // wait its turn.
        state.enqueue(pending(5, 1));
        state.enqueue(pending(1, 1));
        assert!(state.form_batches(&options).is_empty());
        assert_eq!(state.stats().pending_mutations, 2);

        state.finish_batch(8, 1);
        assert_eq!(batch_shapes(&state.form_batches(&options)), vec![(2, 6, 2)]);
    }

    #[test]
    fn test_form_batches_respects_outstanding_size() {
        let options = Options::new().with_max_outstanding_size(25);
        let mut state = State::default();
        for _ in 0..3 {
            state.enqueue(pending(1, 10));
        }
        assert_eq!(batch_shapes(&state.form_batches(&options)), vec![(2, 2, 20)]);
        assert_eq!(state.stats().pending_mutations, 1);
    }

    #[test]
    fn test_idle_waiters() {
        let options = Options::default();
        let mut state = State::default();

        let (tx, mut rx) = oneshot::channel();
        let tx = state.wait_for_idle(tx).expect("should be idle");
        tx.send(()).unwrap();
        assert_eq!(rx.try_recv(), Ok(Some(())));

        state.enqueue(pending(1, 1));
        let (tx, _rx) = oneshot::channel();
        assert!(state.wait_for_idle(tx).is_none());
        assert!(state.take_idle_waiters().is_empty());

        assert_eq!(state.form_batches(&options).len(), 1);
        assert!(state.take_idle_waiters().is_empty());

        state.finish_batch(1, 1);
        assert_eq!(state.take_idle_waiters().len(), 1);
        assert!(state.take_idle_waiters().is_empty());
    }

    #[test]
    fn test_demultiplex() {
        let failures = vec![
            FailedMutation::new(1, Status::permission_denied("nope")),
            FailedMutation::new(7, Status::internal("bogus index")),
        ];
        let (results, bad) = demultiplex(3, Ok(failures));
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err().code(),
            tonic::Code::PermissionDenied
        );
        assert!(results[2].is_ok());
        assert_eq!(bad, vec![7]);

        let (results, bad) = demultiplex(2, Err(Status::unavailable("down")));
        assert!(bad.is_empty());
        assert!(results
            .iter()
            .all(|r| r.as_ref().unwrap_err().code() == tonic::Code::Unavailable));
    }
}
