//! Logging and metrics shared by the Bigtable client crates.
pub mod logging;
pub mod metrics;
