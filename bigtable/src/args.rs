use super::batcher::Options;
use super::Instance;

/// Command-line flags naming the target table and tuning a
/// [`MutationBatcher`](crate::MutationBatcher).
#[derive(clap::Args, Clone, Debug)]
pub struct BatcherArgs {
    /// The name of the GCP project that contains the bigtable instance.
    #[arg(long = "bigtable-project", default_value = "prj")]
    pub project: String,

    /// The name of the bigtable instance to connect to.
    #[arg(long = "bigtable-instance", default_value = "instance")]
    pub instance: String,

    /// The table that mutations are written to.
    #[arg(long = "bigtable-table", default_value = "table")]
    pub table: String,

    /// The most cell mutations sent in one bulk apply (at most 100000).
    #[arg(long = "batcher-max-mutations-per-batch",
        value_name = "N",
        default_value_t = Options::default().max_mutations_per_batch())]
    pub max_mutations_per_batch: usize,

    /// The most bytes sent in one bulk apply.
    #[arg(long = "batcher-max-size-per-batch",
        value_name = "BYTES",
        default_value_t = Options::default().max_size_per_batch())]
    pub max_size_per_batch: usize,

    /// The most bulk applies running at once.
    #[arg(long = "batcher-max-batches",
        value_name = "N",
        default_value_t = Options::default().max_batches())]
    pub max_batches: usize,

    /// The most bytes in batches that haven't completed.
    #[arg(long = "batcher-max-outstanding-size",
        value_name = "BYTES",
        default_value_t = Options::default().max_outstanding_size())]
    pub max_outstanding_size: usize,

    /// The most cell mutations in batches that haven't completed (at most
    /// 300000).
    #[arg(long = "batcher-max-outstanding-mutations",
        value_name = "N",
        default_value_t = Options::default().max_outstanding_mutations())]
    pub max_outstanding_mutations: usize,
}

impl BatcherArgs {
    pub fn instance(&self) -> Instance {
        Instance {
            project: self.project.clone(),
            instance: self.instance.clone(),
        }
    }

    pub fn table_path(&self) -> String {
        self.instance().table_path(&self.table)
    }

    /// Out-of-range limits are clamped, as with the [`Options`] setters.
    pub fn options(&self) -> Options {
        Options::new()
            .with_max_mutations_per_batch(self.max_mutations_per_batch)
            .with_max_size_per_batch(self.max_size_per_batch)
            .with_max_batches(self.max_batches)
            .with_max_outstanding_size(self.max_outstanding_size)
            .with_max_outstanding_mutations(self.max_outstanding_mutations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        batcher: BatcherArgs,
    }

    #[test]
    fn test_defaults_match_options() {
        let cli = Cli::parse_from(["test"]);
        assert_eq!(cli.batcher.options(), Options::default());
        assert_eq!(
            cli.batcher.table_path(),
            "projects/prj/instances/instance/tables/table"
        );
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "test",
            "--bigtable-table",
            "events",
            "--batcher-max-mutations-per-batch",
            "500000",
            "--batcher-max-batches",
            "0",
            "--batcher-max-outstanding-size",
            "1024",
        ]);
        let options = cli.batcher.options();
        assert_eq!(options.max_mutations_per_batch(), 100_000);
        assert_eq!(options.max_batches(), 1);
        assert_eq!(options.max_outstanding_size(), 1024);
        assert!(cli.batcher.table_path().ends_with("/tables/events"));
    }
}
