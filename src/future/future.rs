use crate::error::{ErrorCode, Maybe};
use crate::future::core::{
    ChildContinuation, Continuation, FutureCore, FutureOptions, TaskOutcome,
};
use crate::future::executor::{Executor, Inline};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;

/// Read-only handle to a deferred result.
///
/// A future carries at most one continuation: the single-consumer discipline
/// is what lets a settled value be moved, not copied, into the continuation.
/// Use [`Future::share`] to opt into multiple consumers. Handles are cheap to
/// clone; all clones observe the same shared state.
pub struct Future<T> {
    core: Arc<FutureCore<T>>,
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn from_core(core: Arc<FutureCore<T>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<FutureCore<T>> {
        &self.core
    }

    /// True once the future settled with a value or an error.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.core.is_succeeded()
    }

    pub fn is_failed(&self) -> bool {
        self.core.is_failed()
    }

    /// Clones the committed error of a failed future.
    pub fn peek_error(&self) -> Option<ErrorCode> {
        self.core.peek_error()
    }

    /// Schedules `f` to run on `executor` after this future settles,
    /// whichever way it settles. The callback observes the full result and
    /// decides what propagates: a failed parent does not propagate
    /// automatically through `then`.
    pub fn then<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(Maybe<T>) -> Maybe<U> + Send + 'static,
    {
        self.chain(executor, move |input| TaskOutcome::Result(f(input)))
    }

    /// Schedules a value continuation: `f` runs only when this future
    /// succeeds and never sees the error channel; a parent error is
    /// forwarded to the returned future untouched.
    pub fn map<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(executor, move |input| {
            TaskOutcome::Result(match input {
                Maybe::Value(value) => Maybe::Value(f(value)),
                Maybe::Error(error) => Maybe::Error(error),
            })
        })
    }

    /// As [`Future::map`], for fallible continuations.
    pub fn and_then<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(T) -> Maybe<U> + Send + 'static,
    {
        self.chain(executor, move |input| {
            TaskOutcome::Result(match input {
                Maybe::Value(value) => f(value),
                Maybe::Error(error) => Maybe::Error(error),
            })
        })
    }

    /// As [`Future::map`], for continuations that return another future.
    /// The returned future settles when the inner future does.
    pub fn and_then_future<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        self.chain(executor, move |input| match input {
            Maybe::Value(value) => TaskOutcome::Await(f(value).core.clone()),
            Maybe::Error(error) => TaskOutcome::Result(Maybe::Error(error)),
        })
    }

    /// Adds an error handler: `f` runs only when this future fails and may
    /// recover with a value or substitute another error. A succeeded parent
    /// passes its value through untouched.
    pub fn catch<E, F>(&self, executor: E, f: F) -> Future<T>
    where
        E: Executor,
        F: FnOnce(ErrorCode) -> Maybe<T> + Send + 'static,
    {
        self.chain(executor, move |input| {
            TaskOutcome::Result(match input {
                Maybe::Value(value) => Maybe::Value(value),
                Maybe::Error(error) => f(error),
            })
        })
    }

    fn chain<U, E, F>(&self, executor: E, run: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(Maybe<T>) -> TaskOutcome<U> + Send + 'static,
    {
        let child = FutureCore::new(FutureOptions::empty());
        self.core
            .attach(ChildContinuation::new(child.clone(), executor, run));
        Future::from_core(child)
    }

    /// Converts this future into one that supports any number of
    /// continuations, at the price of cloning the result per consumer.
    pub fn share(&self) -> SharedFuture<T>
    where
        T: Clone,
    {
        let shared = FutureCore::new_shared(FutureOptions::empty());
        self.core.attach(ChildContinuation::new(
            shared.clone(),
            Inline,
            |input: Maybe<T>| TaskOutcome::Result(input),
        ));
        SharedFuture { core: shared }
    }

    /// Blocks the calling thread until the future settles and returns the
    /// result. A synchronization-boundary primitive for shutdown paths and
    /// tests; never part of the hot asynchronous path.
    pub fn wait_result(self) -> Maybe<T> {
        let (sender, receiver) = mpsc::channel();
        self.core.attach(Box::new(WaitContinuation { sender }));
        receiver
            .recv()
            .expect("the future settles or is abandoned with an error")
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("done", &self.is_done())
            .field("failed", &self.is_failed())
            .finish()
    }
}

struct WaitContinuation<T> {
    sender: mpsc::Sender<Maybe<T>>,
}

impl<T: Send + 'static> Continuation<T> for WaitContinuation<T> {
    fn parent_settled(self: Box<Self>, input: Maybe<T>) {
        let _ = self.sender.send(input);
    }
}

/// A future with the single-continuation restriction lifted. Created with
/// [`Future::share`]; each continuation receives its own clone of the
/// result.
pub struct SharedFuture<T: Clone> {
    core: Arc<FutureCore<T>>,
}

impl<T: Clone + Send + 'static> SharedFuture<T> {
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    pub fn is_succeeded(&self) -> bool {
        self.core.is_succeeded()
    }

    pub fn is_failed(&self) -> bool {
        self.core.is_failed()
    }

    pub fn peek_error(&self) -> Option<ErrorCode> {
        self.core.peek_error()
    }

    /// Clones the committed value of a succeeded future.
    pub fn peek_value(&self) -> Option<T> {
        self.core.peek_value()
    }

    /// As [`Future::then`]; may be called any number of times.
    pub fn then<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(Maybe<T>) -> Maybe<U> + Send + 'static,
    {
        let child = FutureCore::new(FutureOptions::empty());
        self.core.attach(ChildContinuation::new(
            child.clone(),
            executor,
            move |input: Maybe<T>| TaskOutcome::Result(f(input)),
        ));
        Future::from_core(child)
    }

    /// As [`Future::map`]; may be called any number of times.
    pub fn map<U, E, F>(&self, executor: E, f: F) -> Future<U>
    where
        U: Send + 'static,
        E: Executor,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(executor, move |input: Maybe<T>| match input {
            Maybe::Value(value) => Maybe::Value(f(value)),
            Maybe::Error(error) => Maybe::Error(error),
        })
    }

    /// As [`Future::catch`]; may be called any number of times.
    pub fn catch<E, F>(&self, executor: E, f: F) -> Future<T>
    where
        E: Executor,
        F: FnOnce(ErrorCode) -> Maybe<T> + Send + 'static,
    {
        self.then(executor, move |input: Maybe<T>| match input {
            Maybe::Value(value) => Maybe::Value(value),
            Maybe::Error(error) => f(error),
        })
    }

    /// Blocks until the future settles and returns a clone of the result.
    pub fn wait_result(&self) -> Maybe<T> {
        let (sender, receiver) = mpsc::channel();
        self.core.attach(Box::new(WaitContinuation { sender }));
        receiver
            .recv()
            .expect("the future settles or is abandoned with an error")
    }
}

impl<T: Clone> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

//=============================================================================
// Creation functions
//=============================================================================

/// Creates a future from a producer callback posted to `executor`.
pub fn post_future<T, E, F>(executor: E, f: F) -> Future<T>
where
    T: Send + 'static,
    E: Executor,
    F: FnOnce() -> Maybe<T> + Send + 'static,
{
    let core = FutureCore::new(FutureOptions::empty());
    core.drive(
        Maybe::ok(),
        executor,
        move |_: Maybe<()>| TaskOutcome::Result(f()),
    );
    Future::from_core(core)
}

/// Creates an already-succeeded future from a value.
pub fn make_succeeded_future<T: Send + 'static>(value: T) -> Future<T> {
    Future::from_core(FutureCore::new_settled(Maybe::Value(value)))
}

/// Creates an already-failed future from an error code.
pub fn make_failed_future<T: Send + 'static>(error: ErrorCode) -> Future<T> {
    Future::from_core(FutureCore::new_settled(Maybe::Error(error)))
}

/// Creates an already-settled future from a full result.
pub fn make_completed_future<T: Send + 'static>(result: Maybe<T>) -> Future<T> {
    Future::from_core(FutureCore::new_settled(result))
}
