//! Continuation futures: promises, executors, combinators and cancellation
//! built on a lock-free atomic state machine.

mod cancellation;
pub use cancellation::{CancellationToken, CancellationTokenSource};

mod core;

mod executor;
pub use executor::{Concurrent, Executor, Inline, Throwing};

#[allow(clippy::module_inception)]
mod future;
pub use future::{
    Future, SharedFuture, make_completed_future, make_failed_future, make_succeeded_future,
    post_future,
};

mod promise;
pub use promise::Promise;

mod state;

mod when_all;
pub use when_all::when_all;

mod when_any;
pub use when_any::when_any;

#[cfg(test)]
mod tests;
