//! Subprocess scheduling and retry policy.
//!
//! Two small building blocks shared by the proxy:
//!
//! - [`ProcessQueue`] runs subprocesses through a fixed concurrency
//!   limit, queueing the overflow in submission order.
//! - [`retry`] re-runs a fallible async operation with exponentially
//!   growing pauses until it succeeds or a wall-clock budget runs out.

mod queue;
mod retry;

pub use queue::{ProcessQueue, QueueStats};
pub use retry::{retry, Backoff, RetryError, RetryOutcome};
