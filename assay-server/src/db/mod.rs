//! Task record store
//!
//! The single source of truth for task state. Every reader and writer in
//! every worker process goes through these functions; nothing caches task
//! state in memory.

pub mod events;
pub mod sweep;
pub mod tasks;
