use std::fmt;

enum TaskFn {
    /// Bare function pointer. Construction does not allocate.
    Ptr(fn()),
    Boxed(Box<dyn FnOnce() + Send>),
}

/// An owned, invoked-at-most-once unit of work.
///
/// A task is exclusively held by whichever container currently schedules it
/// (a queue slot, a task batch, a posted future callback) and is transferred,
/// never shared. [`Task::invoke`] consumes the task; a task that is dropped
/// without having been invoked runs its cancellation hook exactly once
/// instead. Ownership makes the invoke/cancel race inexpressible, so no
/// runtime guard flag is needed.
///
/// Task callables must not panic: a panic unwinds through the scheduler and
/// is a programmer error. Callbacks that may panic belong behind the
/// panic-catching executor of the future module.
pub struct Task {
    invoke: Option<TaskFn>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Task {
    /// Wraps a callable. Allocates once and moves the callable in.
    pub fn new(invoke: impl FnOnce() + Send + 'static) -> Self {
        Self {
            invoke: Some(TaskFn::Boxed(Box::new(invoke))),
            on_cancel: None,
        }
    }

    /// Wraps a bare function pointer without allocating.
    pub fn from_fn(invoke: fn()) -> Self {
        Self {
            invoke: Some(TaskFn::Ptr(invoke)),
            on_cancel: None,
        }
    }

    /// Wraps a callable together with a cancellation hook. The hook runs
    /// exactly once if the task is discarded without being invoked.
    pub fn with_cancel(
        invoke: impl FnOnce() + Send + 'static,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            invoke: Some(TaskFn::Boxed(Box::new(invoke))),
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// Wraps a cleanup callable that runs on both the invoke and the cancel
    /// path, so it is guaranteed to run exactly once either way.
    pub fn cleanup(run: impl FnOnce() + Send + Clone + 'static) -> Self {
        let on_cancel = run.clone();
        Self::with_cancel(run, on_cancel)
    }

    /// Runs the task. The cancellation hook is disarmed first so that it can
    /// never fire after the body ran.
    pub fn invoke(mut self) {
        self.on_cancel = None;
        if let Some(invoke) = self.invoke.take() {
            match invoke {
                TaskFn::Ptr(f) => f(),
                TaskFn::Boxed(f) => f(),
            }
        }
    }

    /// Discards the task, running its cancellation hook. Equivalent to
    /// dropping it; spelled out for call sites where the discard is the
    /// point.
    pub fn cancel(self) {
        drop(self);
    }

    pub fn has_cancel_hook(&self) -> bool {
        self.on_cancel.is_some()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Present only if the task was never invoked.
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("invoked", &self.invoke.is_none())
            .field("cancelable", &self.on_cancel.is_some())
            .finish()
    }
}
