//! Continuation futures and cooperative dispatch queues.
//!
//! The crate has two halves that everything else is built on: a
//! future/promise engine whose completions are committed through a single
//! atomic state word, and a family of dispatch queues (serial, bounded
//! concurrency, dedicated thread, custom) with suspension, task batching,
//! queue-local values and two-mode shutdown. Errors ride a non-throwing
//! provider-tagged channel instead of unwinding.

pub mod error;
pub use error::{ErrorCode, ErrorProvider, Maybe};

pub mod future;
pub use future::{
    CancellationToken, CancellationTokenSource, Future, Promise, SharedFuture, post_future,
    when_all, when_any,
};

pub mod queue;
pub use queue::{DispatchQueue, PendingTaskAction, TaskYieldReason};

mod task;
pub use task::Task;

mod utils;
