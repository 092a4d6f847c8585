//! Bounded-concurrency batch execution
//!
//! Runs a batch of independent async operations with a hard ceiling on the
//! number simultaneously in flight. Outputs come back in input order
//! regardless of completion order, and one operation's failure never
//! aborts its siblings — callers pass fallible futures and get the
//! per-item outcomes back.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Execute `ops` with at most `max_in_flight` running concurrently.
///
/// The cap is enforced by the stream driver itself: at most
/// `max_in_flight` futures are ever polled concurrently, so the ceiling
/// cannot be exceeded even transiently. A cap of zero is treated as one.
pub async fn run_bounded<O, F>(max_in_flight: usize, ops: Vec<F>) -> Vec<O>
where
    F: Future<Output = O>,
{
    let limit = max_in_flight.max(1);
    stream::iter(ops).buffered(limit).collect().await
}
