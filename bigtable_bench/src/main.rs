use anyhow::anyhow;
use clap::Parser;
use futures::StreamExt;
use hdrhistogram::Histogram;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::Status;
use tracing::{debug, info, warn};

use bigtable::args::BatcherArgs;
use bigtable::mutation::set_cell;
use bigtable::{MutationBatcher, Scheduler, SingleRowMutation, TokioScheduler};
use clap_parsers::parse_duration;
use observability::{logging, metrics};
use simulated::SimulatedBigtable;

mod clap_parsers;
mod simulated;

/// Push many row mutations through a batcher backed by a simulated Bigtable
/// to measure admission and completion latency.
#[derive(Parser)]
struct Args {
    /// Number of rows to write.
    #[arg(long, value_name = "N", default_value_t = 10_000)]
    count: usize,

    /// Number of rows waiting on their completion at a time.
    #[arg(long, value_name = "N", default_value_t = 64)]
    concurrency: usize,

    /// Number of cells each row sets.
    #[arg(long, value_name = "N", default_value_t = 4)]
    cells_per_row: usize,

    /// Size of each cell value.
    #[arg(long, value_name = "BYTES", default_value_t = 128)]
    value_size: usize,

    /// How long each simulated bulk apply takes.
    #[arg(long, value_parser = parse_duration, default_value = "5ms")]
    latency: Duration,

    /// Fail every Nth row sent to the simulated Bigtable.
    #[arg(long, value_name = "N")]
    fail_every: Option<usize>,

    /// Report metrics to the local Datadog agent.
    #[arg(long)]
    metrics: bool,

    #[command(flatten)]
    batcher: BatcherArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::configure("bigtable_bench");

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.concurrency == 0 {
        return Err(anyhow!("--concurrency must be at least 1"));
    }
    if args.cells_per_row == 0 {
        warn!("rows with no cells will all be rejected");
    }

    let options = args.batcher.options();
    let bigtable = Arc::new(SimulatedBigtable::new(args.latency, args.fail_every));
    let metrics_client = if args.metrics {
        metrics::Client::new("bigtable_bench")
    } else {
        metrics::Client::NONE
    };
    let batcher = MutationBatcher::with_metrics(
        args.batcher.table_path(),
        bigtable.clone(),
        options,
        metrics_client.clone(),
    );
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());

    info!(
        count = args.count,
        concurrency = args.concurrency,
        cells_per_row = args.cells_per_row,
        value_size = args.value_size,
        latency = ?args.latency,
        metrics = metrics_client.is_enabled(),
        options = ?batcher.options(),
        "benchmarking mutation batcher"
    );
    let start = Instant::now();

    let value = vec![b'x'; args.value_size];
    let mut stream = futures::stream::iter((0..args.count).map(|i| {
        write_row(
            batcher.clone(),
            Arc::clone(&scheduler),
            make_row(i, args.cells_per_row, &value),
        )
    }))
    .buffer_unordered(args.concurrency);

    let mut admission_ns: Histogram<u64> =
        Histogram::new(1).map_err(|err| anyhow!("failed to create histogram: {err:?}"))?;
    let mut completion_ns = admission_ns.clone();
    let mut completed: usize = 0;
    let mut failed: usize = 0;
    let mut rejected: usize = 0;

    let interrupted = loop {
        let times = tokio::select! {
            next = stream.next() => match next {
                Some(times) => times,
                None => break false,
            },
            _ = tokio::signal::ctrl_c() => break true,
        };
        completed += 1;
        record(&mut admission_ns, times.admitted)?;
        record(&mut completion_ns, times.completed)?;
        if let Err(status) = times.result {
            debug!(code = ?status.code(), message = status.message(), "row failed");
            if status.code() == tonic::Code::InvalidArgument {
                rejected += 1;
            } else {
                failed += 1;
            }
        }
    };
    // Rows already handed to the batcher keep going without their callers.
    drop(stream);
    if interrupted {
        warn!(
            completed,
            stats = ?batcher.stats(),
            "interrupted, waiting for outstanding rows"
        );
    }
    metrics_client
        .async_time("bigtable_bench.drain.time", metrics::NO_TAGS, || {
            batcher.wait_for_no_pending_requests()
        })
        .await;

    let elapsed_s = start.elapsed().as_secs_f64();
    info!(
        completed,
        sent = bigtable.rows_seen(),
        elapsed = format!("{:0.3} s", elapsed_s),
        throughput = format!("{:0.3} rows/s", completed as f64 / elapsed_s),
        "completed benchmark"
    );
    log_latencies("admission", &admission_ns);
    log_latencies("completion", &completion_ns);
    if failed > 0 {
        warn!(failed, "rows failed in the simulated bulk apply");
    }
    if rejected > 0 {
        warn!(rejected, "rows were rejected by the batcher");
    }
    Ok(())
}

struct RowTimes {
    admitted: Duration,
    completed: Duration,
    result: Result<(), Status>,
}

async fn write_row(
    batcher: MutationBatcher,
    scheduler: Arc<dyn Scheduler>,
    row: SingleRowMutation,
) -> RowTimes {
    let start = Instant::now();
    let (admission, completion) = batcher.apply(&scheduler, row);
    admission.await;
    let admitted = start.elapsed();
    let result = completion.await;
    RowTimes {
        admitted,
        completed: start.elapsed(),
        result,
    }
}

fn make_row(i: usize, cells: usize, value: &[u8]) -> SingleRowMutation {
    let mut row = SingleRowMutation::new(format!("bench-{i:010}"));
    for cell in 0..cells {
        row.push(set_cell("f", format!("c{cell}"), value));
    }
    row
}

fn record(histogram: &mut Histogram<u64>, duration: Duration) -> anyhow::Result<()> {
    let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
    histogram
        .record(ns)
        .map_err(|err| anyhow!("failed to record latency: {err:?}"))
}

fn log_latencies(name: &str, durations_ns: &Histogram<u64>) {
    if durations_ns.len() == 0 {
        return;
    }
    info!(
        latency = name,
        min = format!("{:0.3} ms", durations_ns.min() as f64 / 1e6),
        mean = format!("{:0.3} ms", durations_ns.mean() / 1e6),
        p50 = format!(
            "{:0.3} ms",
            durations_ns.value_at_quantile(0.50) as f64 / 1e6
        ),
        p95 = format!(
            "{:0.3} ms",
            durations_ns.value_at_quantile(0.95) as f64 / 1e6
        ),
        p99 = format!(
            "{:0.3} ms",
            durations_ns.value_at_quantile(0.99) as f64 / 1e6
        ),
        max = format!("{:0.3} ms", durations_ns.max() as f64 / 1e6),
        "row latency"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_row() {
        let row = make_row(42, 3, b"abc");
        assert_eq!(row.row_key(), b"bench-0000000042");
        assert_eq!(row.num_mutations(), 3);
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "bigtable_bench",
            "--count",
            "10",
            "--latency",
            "1ms",
            "--batcher-max-batches",
            "2",
        ]);
        assert_eq!(args.count, 10);
        assert_eq!(args.latency, Duration::from_millis(1));
        assert_eq!(args.batcher.options().max_batches(), 2);
        assert_eq!(args.fail_every, None);
    }

    #[tokio::test]
    async fn test_write_row() {
        let simulated = Arc::new(SimulatedBigtable::new(Duration::ZERO, Some(2)));
        let batcher = MutationBatcher::new("t", simulated.clone(), bigtable::Options::default());
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());

        let first = write_row(batcher.clone(), scheduler.clone(), make_row(0, 1, b"v")).await;
        assert!(first.result.is_ok());
        assert!(first.admitted <= first.completed);

        let second = write_row(batcher.clone(), scheduler, make_row(1, 1, b"v")).await;
        assert_eq!(second.result.unwrap_err().code(), tonic::Code::Unavailable);
        assert_eq!(simulated.rows_seen(), 2);
    }
}
