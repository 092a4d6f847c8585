//! Database access layer shared across assay crates

pub mod init;

pub use init::{init_database, init_schema};
