pub mod args;
pub mod batcher;
pub mod bulk;
pub mod mutation;

pub use batcher::{MutationBatcher, Options};
pub use bulk::{BulkApply, FailedMutation, Scheduler, TokioScheduler};
pub use mutation::SingleRowMutation;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    pub project: String,
    pub instance: String,
}

impl Instance {
    pub fn path(&self) -> String {
        format!(
            "projects/{project}/instances/{instance}",
            project = self.project,
            instance = self.instance,
        )
    }

    /// The full name of a table in this instance, as used in data requests.
    pub fn table_path(&self, table: &str) -> String {
        format!("{path}/tables/{table}", path = self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_path() {
        let instance = Instance {
            project: String::from("prj"),
            instance: String::from("inst"),
        };
        assert_eq!(instance.path(), "projects/prj/instances/inst");
        assert_eq!(
            instance.table_path("events"),
            "projects/prj/instances/inst/tables/events"
        );
    }
}
