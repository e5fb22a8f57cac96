use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tonic::Status;
use tracing::trace;

use bigtable::bulk::{BulkApply, FailedMutation};
use bigtable::mutation::MutateRowsEntry;

/// Stands in for Bigtable. Each bulk apply takes `latency`, and every
/// `fail_every`th row it's given fails.
#[derive(Debug)]
pub struct SimulatedBigtable {
    latency: Duration,
    fail_every: Option<usize>,
    rows_seen: AtomicUsize,
}

impl SimulatedBigtable {
    pub fn new(latency: Duration, fail_every: Option<usize>) -> Self {
        Self {
            latency,
            fail_every: fail_every.filter(|n| *n > 0),
            rows_seen: AtomicUsize::new(0),
        }
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BulkApply for SimulatedBigtable {
    async fn bulk_apply(
        &self,
        table: &str,
        entries: Vec<MutateRowsEntry>,
    ) -> Result<Vec<FailedMutation>, Status> {
        trace!(table, rows = entries.len(), "simulating bulk apply");
        let first = self.rows_seen.fetch_add(entries.len(), Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let Some(every) = self.fail_every else {
            return Ok(Vec::new());
        };
        Ok((0..entries.len())
            .filter(|index| (first + index + 1) % every == 0)
            .map(|index| {
                FailedMutation::new(index, Status::unavailable("simulated row failure"))
            })
            .collect())
    }
}
