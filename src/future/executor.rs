use crate::queue::DispatchQueue;
use crate::task::Task;

/// Strategy deciding where a continuation's callback runs.
///
/// An executor only needs to accept posted tasks; the future machinery wraps
/// callbacks into [`Task`]s whose cancellation hooks keep a future from
/// hanging if the executor discards work.
pub trait Executor: Send + Sync + 'static {
    fn post_task(&self, task: Task);

    /// True if callbacks bound through this executor convert panics into
    /// error codes instead of unwinding. See [`Throwing`].
    fn catches_panic(&self) -> bool {
        false
    }
}

/// Queue-bound execution: a dispatch queue is itself an executor.
impl Executor for DispatchQueue {
    fn post_task(&self, task: Task) {
        self.post(task);
    }
}

/// Always posts to the process-wide concurrent queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct Concurrent;

impl Executor for Concurrent {
    fn post_task(&self, task: Task) {
        DispatchQueue::concurrent_queue().post(task);
    }
}

/// Executes synchronously on the posting thread. Used for cheap
/// transformation chains where a queue hop would cost more than the work.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn post_task(&self, task: Task) {
        task.invoke();
    }
}

/// Wraps any executor so that a panicking callback settles the future with a
/// panic-provider error code instead of unwinding through the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Throwing<E>(pub E);

impl<E: Executor> Executor for Throwing<E> {
    fn post_task(&self, task: Task) {
        self.0.post_task(task);
    }

    fn catches_panic(&self) -> bool {
        true
    }
}
