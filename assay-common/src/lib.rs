//! assay-common - shared plumbing for the assay services
//!
//! Error type, configuration loading, database initialization and
//! pagination math used by the assay-server crate and its tests.

pub mod config;
pub mod db;
pub mod error;
pub mod pagination;

pub use error::{Error, Result};
