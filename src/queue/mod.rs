//! Serial, concurrent, dedicated-thread and custom task queues with
//! suspension, batching, queue-local values and two-mode shutdown.

use crate::task::Task;
use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

pub(crate) mod pool;

mod scheduler;
pub use scheduler::DispatchScheduler;
pub(crate) use scheduler::{LooperScheduler, PoolScheduler};

mod service;
pub(crate) use service::QueueService;

#[cfg(test)]
mod tests;

/// What to do with pending tasks on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingTaskAction {
    /// Run remaining tasks to completion.
    Complete,
    /// Discard remaining tasks through their cancellation hooks.
    Cancel,
}

/// Why a running task is being asked to yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskYieldReason {
    QueueShutdown,
    QueueSuspended,
    TimeExpired,
}

/// Serial or concurrent dispatch queue.
///
/// The handle is a pointer-sized shared reference to internal state; it is
/// cheap to clone and to compare. Use [`DispatchQueue::post`] or
/// [`DispatchQueue::invoke_else_post`] to submit tasks,
/// [`DispatchQueue::suspend`] to temporarily withhold dispatch,
/// [`DispatchQueue::start_task_batching`] to coalesce posts from the current
/// thread, and [`DispatchQueue::shutdown`] to finish task processing.
#[derive(Clone)]
pub struct DispatchQueue {
    state: Arc<QueueService>,
}

impl DispatchQueue {
    fn from_scheduler(scheduler: Box<dyn DispatchScheduler>, name: String) -> Self {
        let mut scheduler = scheduler;
        let state = Arc::new_cyclic(|weak: &Weak<QueueService>| {
            scheduler.initialize(WeakDispatchQueue {
                inner: weak.clone(),
            });
            QueueService::new(name, scheduler)
        });
        tracing::debug!(queue = %state.name(), "dispatch queue created");
        DispatchQueue { state }
    }

    pub(crate) fn service(&self) -> &Arc<QueueService> {
        &self.state
    }

    /// Creates a new serial queue on top of the shared thread pool.
    pub fn make_serial_queue() -> DispatchQueue {
        Self::builder().serial().build()
    }

    /// Creates a concurrent queue that runs up to `max_threads` tasks at a
    /// time. Zero selects the pool-default limit; one is equivalent to a
    /// serial queue.
    pub fn make_concurrent_queue(max_threads: u32) -> DispatchQueue {
        Self::builder().concurrent(max_threads).build()
    }

    /// Creates a queue that owns a dedicated thread until shutdown.
    pub fn make_looper_queue() -> DispatchQueue {
        Self::builder().looper().build()
    }

    /// Creates a queue driven by a caller-supplied scheduler.
    pub fn make_custom_queue(scheduler: Box<dyn DispatchScheduler>) -> DispatchQueue {
        Self::from_scheduler(scheduler, "strand-custom".to_string())
    }

    /// The process-wide concurrent queue, created on demand.
    pub fn concurrent_queue() -> DispatchQueue {
        static CONCURRENT: OnceLock<DispatchQueue> = OnceLock::new();
        CONCURRENT
            .get_or_init(|| {
                Self::builder()
                    .concurrent(0)
                    .name("strand-concurrent")
                    .build()
            })
            .clone()
    }

    /// The queue whose task is currently running on this thread, if any.
    pub fn current_queue() -> Option<DispatchQueue> {
        QueueService::current_queue_service().map(|state| DispatchQueue { state })
    }

    /// The queue registered for the UI thread, if any. There is no dispatcher
    /// by default; hosts that own a UI thread register one explicitly.
    pub fn ui_thread_queue() -> Option<DispatchQueue> {
        ui_queue_slot().lock().clone()
    }

    /// Registers `queue` as the UI-thread queue and returns the previous
    /// registration.
    pub fn register_ui_thread_queue(queue: DispatchQueue) -> Option<DispatchQueue> {
        ui_queue_slot().lock().replace(queue)
    }

    pub fn builder() -> QueueBuilder {
        QueueBuilder::new()
    }

    /// Posts the task to the end of the queue for asynchronous invocation.
    /// Tasks posted after shutdown are silently canceled.
    pub fn post(&self, task: Task) {
        self.state.post(task);
    }

    /// Invokes the task immediately if the calling thread is currently
    /// running a task of this queue; otherwise posts it. The immediate
    /// execution ignores the suspend and shutdown states.
    pub fn invoke_else_post(&self, task: Task) {
        self.state.invoke_else_post(task);
    }

    /// When called from within a task of this queue, appends the task to the
    /// current task's deferred batch: it runs after the enclosing task
    /// unwinds, but before the queue moves on to unrelated tasks. Otherwise
    /// posts it.
    pub fn defer_else_post(&self, task: Task) {
        self.state.defer_else_post(task);
    }

    /// True if the current task is being invoked in the context of this
    /// queue.
    pub fn is_current_queue(&self) -> bool {
        self.state.is_current_queue()
    }

    /// True if tasks are invoked in a serial order by this queue.
    pub fn is_serial(&self) -> bool {
        self.state.scheduler().is_serial()
    }

    /// True if the queue is running on the current thread or associated with
    /// it.
    pub fn has_thread_access(&self) -> bool {
        self.state.has_thread_access()
    }

    /// Cooperative preemption probe for long-running tasks.
    ///
    /// Must not be checked at the start of a task, before any work has been
    /// done: a trivial scheduler may report `Some` on every call, and a task
    /// that yields on the first probe would never make progress. Poll only
    /// after a unit of forward progress.
    pub fn should_yield(&self) -> Option<TaskYieldReason> {
        self.state.should_yield()
    }

    /// Starts collecting every post from this thread to this queue into one
    /// compound task. The batch auto-posts when the returned guard is
    /// dropped, unless it was explicitly posted, deferred or canceled.
    pub fn start_task_batching(&self) -> TaskBatch {
        self.state.begin_task_batching();
        TaskBatch {
            service: Some(self.state.clone()),
            _not_send: PhantomData,
        }
    }

    /// True if posts from the current thread are being collected into a
    /// task batch.
    pub fn has_task_batching(&self) -> bool {
        self.state.has_task_batching()
    }

    /// Tries to lock the queue-local value slot identified by `key`,
    /// creating the value on first lock. Returns `None` when the slot is
    /// already locked or the queue is shut down. The guard must be dropped on
    /// the locking thread; the value is destroyed at queue shutdown.
    pub fn try_lock_local_value<T: Default + Send + 'static>(
        &self,
        key: &'static QueueLocalKey<T>,
    ) -> Option<LocalValueGuard<T>> {
        let value = self.state.try_lock_local::<T>(key.addr())?;
        Some(LocalValueGuard {
            service: self.state.clone(),
            key: key.addr(),
            value: Some(value),
            _not_send: PhantomData,
        })
    }

    /// Suspends asynchronous task invocation and returns a guard that
    /// resumes it when dropped. Each guard clone suspends once more; dispatch
    /// resumes when every guard is gone.
    pub fn suspend(&self) -> SuspendGuard {
        self.state.suspend();
        SuspendGuard {
            service: Some(self.state.clone()),
        }
    }

    /// Shuts the queue down. New asynchronous tasks are canceled; pending
    /// tasks are completed or canceled per `action`. Only the first shutdown
    /// decides the policy.
    pub fn shutdown(&self, action: PendingTaskAction) {
        self.state.shutdown(action);
    }

    /// Blocks until all pending and in-flight tasks have finished being
    /// processed after shutdown.
    pub fn await_termination(&self) {
        self.state.await_termination();
    }

    /// True if the queue has tasks waiting to be invoked.
    pub fn has_tasks(&self) -> bool {
        self.state.has_tasks()
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    //=========================================================================
    // Driving surface for custom schedulers
    //=========================================================================

    /// Dequeues and invokes one task. Returns false when nothing was
    /// dispatchable. Intended for [`DispatchScheduler`] implementations.
    pub fn invoke_one_task(&self) -> bool {
        self.state.begin_drain();
        let invoked = self.state.invoke_one_task(None);
        self.state.end_drain();
        invoked
    }

    /// Invokes tasks until the queue has nothing dispatchable.
    pub fn invoke_all_tasks(&self) {
        self.state.invoke_all_tasks();
    }

    /// Invokes tasks until the queue is empty or the duration elapsed; the
    /// deadline is also surfaced to tasks through `should_yield`.
    pub fn invoke_tasks_for(&self, duration: Duration) {
        self.state.invoke_tasks_for(duration);
    }
}

impl PartialEq for DispatchQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for DispatchQueue {}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("name", &self.name())
            .field("serial", &self.is_serial())
            .finish()
    }
}

fn ui_queue_slot() -> &'static Mutex<Option<DispatchQueue>> {
    static UI_QUEUE: OnceLock<Mutex<Option<DispatchQueue>>> = OnceLock::new();
    UI_QUEUE.get_or_init(|| Mutex::new(None))
}

/// Non-owning dispatch queue reference handed to schedulers, so a scheduler
/// does not keep its own queue alive.
#[derive(Clone)]
pub struct WeakDispatchQueue {
    inner: Weak<QueueService>,
}

impl WeakDispatchQueue {
    pub(crate) fn empty() -> Self {
        Self { inner: Weak::new() }
    }

    pub fn upgrade(&self) -> Option<DispatchQueue> {
        self.inner.upgrade().map(|state| DispatchQueue { state })
    }
}

//=============================================================================
// Builder
//=============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Serial,
    Concurrent(u32),
    Looper,
}

/// Largest accepted explicit concurrency limit. Values beyond this are
/// overwhelmingly a sign of a units mistake at the call site.
const MAX_CONCURRENCY: u32 = 1024;

/// Configures and creates a [`DispatchQueue`].
#[derive(Debug)]
pub struct QueueBuilder {
    kind: QueueKind,
    name: Option<String>,
}

impl QueueBuilder {
    fn new() -> Self {
        Self {
            kind: QueueKind::Serial,
            name: None,
        }
    }

    pub fn serial(mut self) -> Self {
        self.kind = QueueKind::Serial;
        self
    }

    pub fn concurrent(mut self, max_threads: u32) -> Self {
        self.kind = QueueKind::Concurrent(max_threads);
        self
    }

    pub fn looper(mut self) -> Self {
        self.kind = QueueKind::Looper;
        self
    }

    /// Names the queue for diagnostics, and the thread for looper queues.
    /// Thread names are truncated beyond 15 bytes by pthread limitations.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Creates the configured queue.
    pub fn try_build(self) -> Result<DispatchQueue> {
        if let QueueKind::Concurrent(max_threads) = self.kind {
            if max_threads > MAX_CONCURRENCY {
                bail!(
                    "concurrent queue limit {} exceeds the supported maximum of {}",
                    max_threads,
                    MAX_CONCURRENCY
                );
            }
        }

        let name = self.name.clone().unwrap_or_else(|| {
            match self.kind {
                QueueKind::Serial => "strand-serial",
                QueueKind::Concurrent(_) => "strand-concurrent",
                QueueKind::Looper => "strand-looper",
            }
            .to_string()
        });

        let scheduler: Box<dyn DispatchScheduler> = match self.kind {
            QueueKind::Serial => Box::new(PoolScheduler::new(1)),
            QueueKind::Concurrent(max_threads) => {
                let limit = match max_threads {
                    0 => pool::shared_pool().default_concurrency(),
                    n => n as usize,
                };
                Box::new(PoolScheduler::new(limit))
            }
            QueueKind::Looper => Box::new(LooperScheduler::new()),
        };

        Ok(DispatchQueue::from_scheduler(scheduler, name))
    }

    #[track_caller]
    fn build(self) -> DispatchQueue {
        match self.try_build() {
            Ok(queue) => queue,
            Err(error) => panic!("failed to create dispatch queue: {error:?}"),
        }
    }
}

//=============================================================================
// Guards
//=============================================================================

/// Resumes a suspended queue when dropped. Cloning suspends the queue once
/// more; every clone must be dropped (or explicitly resumed) before dispatch
/// flows again.
pub struct SuspendGuard {
    service: Option<Arc<QueueService>>,
}

impl SuspendGuard {
    /// Resumes the queue now instead of at drop.
    pub fn resume(mut self) {
        if let Some(service) = self.service.take() {
            service.resume();
        }
    }
}

impl Clone for SuspendGuard {
    fn clone(&self) -> Self {
        if let Some(service) = &self.service {
            service.suspend();
        }
        Self {
            service: self.service.clone(),
        }
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        if let Some(service) = self.service.take() {
            service.resume();
        }
    }
}

/// Ends task batching for the creating thread when posted, deferred,
/// canceled, or dropped (drop posts). All methods must be called on the
/// thread that started the batch.
pub struct TaskBatch {
    service: Option<Arc<QueueService>>,
    _not_send: PhantomData<*mut ()>,
}

impl TaskBatch {
    /// Posts the batch for invocation as a single task.
    pub fn post(mut self) {
        if let Some(service) = self.service.take() {
            let task = service.end_task_batching();
            service.post(task);
        }
    }

    /// Invokes or posts the batch as a single task.
    pub fn invoke_else_post(mut self) {
        if let Some(service) = self.service.take() {
            let task = service.end_task_batching();
            service.invoke_else_post(task);
        }
    }

    /// Defers or posts the batch as a single task.
    pub fn defer_else_post(mut self) {
        if let Some(service) = self.service.take() {
            let task = service.end_task_batching();
            service.defer_else_post(task);
        }
    }

    /// Cancels the batch; the collected tasks run their cancellation hooks.
    pub fn cancel(mut self) {
        if let Some(service) = self.service.take() {
            service.end_task_batching().cancel();
        }
    }
}

impl Drop for TaskBatch {
    fn drop(&mut self) {
        if let Some(service) = self.service.take() {
            let task = service.end_task_batching();
            service.post(task);
        }
    }
}

/// Identity of a queue-local value. Declare as a `static` item; the address
/// of the static is the key under which the queue stores the value.
pub struct QueueLocalKey<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> QueueLocalKey<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn addr(&'static self) -> usize {
        self as *const Self as usize
    }
}

impl<T> Default for QueueLocalKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a queue-local value, checked out of the queue's slot
/// table. Dropping the guard returns the value to the queue; it must happen
/// on the locking thread.
pub struct LocalValueGuard<T: Send + 'static> {
    service: Arc<QueueService>,
    key: usize,
    value: Option<Box<T>>,
    _not_send: PhantomData<*mut ()>,
}

impl<T: Send + 'static> Deref for LocalValueGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("value present until drop")
    }
}

impl<T: Send + 'static> DerefMut for LocalValueGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value present until drop")
    }
}

impl<T: Send + 'static> Drop for LocalValueGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let value: Box<dyn Any + Send> = value;
            self.service.unlock_local(self.key, value);
        }
    }
}
