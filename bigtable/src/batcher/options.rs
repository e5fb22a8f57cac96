/// Bigtable rejects `MutateRows` requests with more mutations than this.
pub const BIGTABLE_MUTATION_LIMIT: usize = 100_000;

/// The most mutations a batcher will keep in flight.
pub const BIGTABLE_OUTSTANDING_MUTATION_LIMIT: usize = 300_000;

// The defaults stay well under the service limits so that request overheads
// and size estimates don't tip a batch over.
const DEFAULT_MUTATION_LIMIT: usize = 1000;
const DEFAULT_MAX_SIZE_PER_BATCH: usize = 2 * 1024 * 1024;
const DEFAULT_MAX_BATCHES: usize = 4;
const DEFAULT_MAX_OUTSTANDING_SIZE: usize = DEFAULT_MAX_SIZE_PER_BATCH * DEFAULT_MAX_BATCHES;

/// Limits for a [`MutationBatcher`](super::MutationBatcher).
///
/// Mutation counts are the number of cell mutations (not rows), and sizes are
/// protobuf-encoded bytes. Setters clamp out-of-range values instead of
/// failing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Options {
    max_mutations_per_batch: usize,
    max_size_per_batch: usize,
    max_batches: usize,
    max_outstanding_size: usize,
    max_outstanding_mutations: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_mutations_per_batch: DEFAULT_MUTATION_LIMIT,
            max_size_per_batch: DEFAULT_MAX_SIZE_PER_BATCH,
            max_batches: DEFAULT_MAX_BATCHES,
            max_outstanding_size: DEFAULT_MAX_OUTSTANDING_SIZE,
            max_outstanding_mutations: BIGTABLE_OUTSTANDING_MUTATION_LIMIT,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped `<= BIGTABLE_MUTATION_LIMIT`.
    pub fn with_max_mutations_per_batch(self, max: usize) -> Self {
        Self {
            max_mutations_per_batch: max.min(BIGTABLE_MUTATION_LIMIT),
            ..self
        }
    }

    pub fn with_max_size_per_batch(self, max: usize) -> Self {
        Self {
            max_size_per_batch: max,
            ..self
        }
    }

    /// The number of bulk applies that may run at once. Clamped `>= 1`.
    pub fn with_max_batches(self, max: usize) -> Self {
        Self {
            max_batches: max.max(1),
            ..self
        }
    }

    pub fn with_max_outstanding_size(self, max: usize) -> Self {
        Self {
            max_outstanding_size: max,
            ..self
        }
    }

    /// Clamped `<= BIGTABLE_OUTSTANDING_MUTATION_LIMIT`.
    pub fn with_max_outstanding_mutations(self, max: usize) -> Self {
        Self {
            max_outstanding_mutations: max.min(BIGTABLE_OUTSTANDING_MUTATION_LIMIT),
            ..self
        }
    }

    pub fn max_mutations_per_batch(&self) -> usize {
        self.max_mutations_per_batch
    }

    pub fn max_size_per_batch(&self) -> usize {
        self.max_size_per_batch
    }

    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    pub fn max_outstanding_size(&self) -> usize {
        self.max_outstanding_size
    }

    pub fn max_outstanding_mutations(&self) -> usize {
        self.max_outstanding_mutations
    }

    /// The most cell mutations a single row may carry and still fit in a
    /// batch under both the per-batch and outstanding limits.
    pub(super) fn row_mutation_limit(&self) -> usize {
        self.max_mutations_per_batch
            .min(self.max_outstanding_mutations)
    }

    /// Like [`Self::row_mutation_limit`], in bytes.
    pub(super) fn row_size_limit(&self) -> usize {
        self.max_size_per_batch.min(self.max_outstanding_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_defaults() {
        expect![[r#"
            Options {
                max_mutations_per_batch: 1000,
                max_size_per_batch: 2097152,
                max_batches: 4,
                max_outstanding_size: 8388608,
                max_outstanding_mutations: 300000,
            }
        "#]]
        .assert_debug_eq(&Options::default());
    }

    #[test]
    fn test_clamping() {
        let options = Options::new()
            .with_max_mutations_per_batch(1_000_000)
            .with_max_outstanding_mutations(1_000_000)
            .with_max_batches(0)
            .with_max_size_per_batch(usize::MAX)
            .with_max_outstanding_size(usize::MAX);
        assert_eq!(options.max_mutations_per_batch(), BIGTABLE_MUTATION_LIMIT);
        assert_eq!(
            options.max_outstanding_mutations(),
            BIGTABLE_OUTSTANDING_MUTATION_LIMIT
        );
        assert_eq!(options.max_batches(), 1);
        assert_eq!(options.max_size_per_batch(), usize::MAX);
        assert_eq!(options.max_outstanding_size(), usize::MAX);
    }

    #[test]
    fn test_in_range_values_kept() {
        let options = Options::new()
            .with_max_mutations_per_batch(10)
            .with_max_size_per_batch(500)
            .with_max_batches(2)
            .with_max_outstanding_size(400)
            .with_max_outstanding_mutations(5);
        assert_eq!(options.max_mutations_per_batch(), 10);
        assert_eq!(options.max_size_per_batch(), 500);
        assert_eq!(options.max_batches(), 2);
        assert_eq!(options.max_outstanding_size(), 400);
        assert_eq!(options.max_outstanding_mutations(), 5);
        assert_eq!(options.row_mutation_limit(), 5);
        assert_eq!(options.row_size_limit(), 400);
    }
}
