use crate::queue::scheduler::DispatchScheduler;
use crate::queue::{PendingTaskAction, TaskYieldReason};
use crate::task::Task;
use crate::utils::ScopeGuard;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Most dispatch tasks finish quickly and defer only a handful of follow-ups;
/// keep those on the stack.
const DEFERRED_SPILL_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueStatus {
    Active,
    ShutdownComplete,
    ShutdownCancel,
}

impl QueueStatus {
    fn from_u8(value: u8) -> QueueStatus {
        match value {
            0 => QueueStatus::Active,
            1 => QueueStatus::ShutdownComplete,
            2 => QueueStatus::ShutdownCancel,
            _ => unreachable!("invalid queue status"),
        }
    }
}

/// Per-thread record of the task invocation currently in progress.
///
/// A stack because task invocation nests: `invoke_else_post` may run a task
/// of another queue inline from within a task of this one.
struct TaskContext {
    service: Weak<QueueService>,
    service_addr: usize,
    deferred: RefCell<SmallVec<[Task; DEFERRED_SPILL_THRESHOLD]>>,
    deadline: Option<Instant>,
}

/// One level of task batching started by `start_task_batching`. Posts from
/// this thread to the owning queue land in `tasks` instead of the queue.
struct BatchFrame {
    service_addr: usize,
    tasks: Vec<Task>,
}

thread_local! {
    static CURRENT_TASKS: RefCell<Vec<TaskContext>> = const { RefCell::new(Vec::new()) };
    static BATCHES: RefCell<Vec<BatchFrame>> = const { RefCell::new(Vec::new()) };
}

pub(crate) enum LocalSlot {
    Stored(Box<dyn Any + Send>),
    Locked,
}

// SAFETY: the stored payload is `Send` but not `Sync`. All access to the
// payload goes through the checkout/`Locked` swap protocol under the
// DashMap shard lock — a value is moved out (leaving `Locked`) before it is
// touched and moved back in on unlock, so no `&` to the payload is ever
// shared across threads concurrently. That makes `LocalSlot` safe to share.
unsafe impl Sync for LocalSlot {}

/// Shared state behind every `DispatchQueue` handle.
///
/// Owns the FIFO task list, the suspend counter, per-thread batching, the
/// queue-local value table and the shutdown/termination lifecycle; delegates
/// the decision of where and when tasks run to its `DispatchScheduler`.
pub(crate) struct QueueService {
    name: String,
    scheduler: Box<dyn DispatchScheduler>,
    tasks: Mutex<VecDeque<Task>>,
    suspend_count: AtomicUsize,
    status: AtomicU8,
    /// Drain passes currently invoking tasks of this queue.
    inflight: AtomicUsize,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    locals: DashMap<usize, LocalSlot>,
}

impl QueueService {
    pub(crate) fn new(name: String, scheduler: Box<dyn DispatchScheduler>) -> Self {
        Self {
            name,
            scheduler,
            tasks: Mutex::new(VecDeque::new()),
            suspend_count: AtomicUsize::new(0),
            status: AtomicU8::new(0),
            inflight: AtomicUsize::new(0),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            locals: DashMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn scheduler(&self) -> &dyn DispatchScheduler {
        self.scheduler.as_ref()
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) fn status(&self) -> QueueStatus {
        QueueStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    //=========================================================================
    // Posting
    //=========================================================================

    pub(crate) fn post(&self, task: Task) {
        let Some(task) = self.try_append_to_batch(task) else {
            return;
        };

        if self.status() != QueueStatus::Active {
            tracing::trace!(queue = %self.name, "task posted after shutdown; canceling");
            task.cancel();
            return;
        }

        self.tasks.lock().push_back(task);
        self.scheduler.post();
    }

    pub(crate) fn invoke_else_post(self: &Arc<Self>, task: Task) {
        // Inline execution deliberately ignores the suspend and shutdown
        // states: the caller is already running in this queue's context.
        if self.is_current_queue() {
            self.invoke_task(task, None);
        } else {
            self.post(task);
        }
    }

    pub(crate) fn defer_else_post(&self, task: Task) {
        let deferred = CURRENT_TASKS.with(|stack| {
            let stack = stack.borrow();
            match stack.last() {
                Some(ctx) if ctx.service_addr == self.addr() => {
                    ctx.deferred.borrow_mut().push(task);
                    None
                }
                _ => Some(task),
            }
        });
        if let Some(task) = deferred {
            self.post(task);
        }
    }

    //=========================================================================
    // Identity and yielding
    //=========================================================================

    pub(crate) fn is_current_queue(&self) -> bool {
        CURRENT_TASKS.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|ctx| ctx.service_addr == self.addr())
        })
    }

    pub(crate) fn current_queue_service() -> Option<Arc<QueueService>> {
        CURRENT_TASKS.with(|stack| {
            stack
                .borrow()
                .last()
                .and_then(|ctx| ctx.service.upgrade())
        })
    }

    pub(crate) fn has_thread_access(&self) -> bool {
        self.scheduler.has_thread_access() || self.is_current_queue()
    }

    pub(crate) fn should_yield(&self) -> Option<TaskYieldReason> {
        if self.status() != QueueStatus::Active {
            return Some(TaskYieldReason::QueueShutdown);
        }
        if self.suspend_count.load(Ordering::Acquire) > 0 {
            return Some(TaskYieldReason::QueueSuspended);
        }
        let expired = CURRENT_TASKS.with(|stack| {
            stack.borrow().last().is_some_and(|ctx| {
                ctx.service_addr == self.addr()
                    && ctx.deadline.is_some_and(|deadline| Instant::now() >= deadline)
            })
        });
        if expired {
            return Some(TaskYieldReason::TimeExpired);
        }
        None
    }

    //=========================================================================
    // Task invocation
    //=========================================================================

    /// Invokes a task in this queue's context, then drains the deferred
    /// tasks it produced before the queue moves on to unrelated work.
    pub(crate) fn invoke_task(self: &Arc<Self>, task: Task, deadline: Option<Instant>) {
        CURRENT_TASKS.with(|stack| {
            stack.borrow_mut().push(TaskContext {
                service: Arc::downgrade(self),
                service_addr: self.addr(),
                deferred: RefCell::new(SmallVec::new()),
                deadline,
            });
        });
        let _restore = ScopeGuard::new(|| {
            CURRENT_TASKS.with(|stack| {
                stack.borrow_mut().pop();
            });
        });

        task.invoke();

        // Deferred tasks run as part of the current invocation; tasks they
        // defer themselves join the same drain.
        loop {
            let deferred = CURRENT_TASKS.with(|stack| {
                let stack = stack.borrow();
                let ctx = stack.last().expect("task context pushed above");
                let mut deferred = ctx.deferred.borrow_mut();
                if deferred.is_empty() {
                    None
                } else {
                    Some(deferred.remove(0))
                }
            });
            match deferred {
                Some(task) => task.invoke(),
                None => break,
            }
        }
    }

    fn try_dequeue(&self) -> Option<Task> {
        if self.suspend_count.load(Ordering::Acquire) > 0 {
            return None;
        }
        match self.status() {
            QueueStatus::Active | QueueStatus::ShutdownComplete => self.tasks.lock().pop_front(),
            QueueStatus::ShutdownCancel => None,
        }
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    pub(crate) fn has_dispatchable_tasks(&self) -> bool {
        self.suspend_count.load(Ordering::Acquire) == 0
            && self.status() != QueueStatus::ShutdownCancel
            && self.has_tasks()
    }

    /// Marks the start of a drain pass. Paired with [`QueueService::end_drain`].
    pub(crate) fn begin_drain(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_drain(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        self.maybe_signal_termination();
    }

    /// Dequeues and invokes a single task. Returns false when nothing was
    /// dispatchable.
    pub(crate) fn invoke_one_task(self: &Arc<Self>, deadline: Option<Instant>) -> bool {
        match self.try_dequeue() {
            Some(task) => {
                self.invoke_task(task, deadline);
                true
            }
            None => false,
        }
    }

    pub(crate) fn invoke_all_tasks(self: &Arc<Self>) {
        self.begin_drain();
        while self.invoke_one_task(None) {}
        self.end_drain();
    }

    pub(crate) fn invoke_tasks_for(self: &Arc<Self>, duration: Duration) {
        let deadline = Instant::now() + duration;
        self.begin_drain();
        while Instant::now() < deadline && self.invoke_one_task(Some(deadline)) {}
        self.end_drain();
    }

    //=========================================================================
    // Batching
    //=========================================================================

    pub(crate) fn begin_task_batching(&self) {
        BATCHES.with(|batches| {
            batches.borrow_mut().push(BatchFrame {
                service_addr: self.addr(),
                tasks: Vec::new(),
            });
        });
    }

    /// Pops the innermost batch frame of this queue on the current thread and
    /// returns its content as a single compound task.
    pub(crate) fn end_task_batching(&self) -> Task {
        let frame = BATCHES.with(|batches| {
            let mut batches = batches.borrow_mut();
            let index = batches
                .iter()
                .rposition(|frame| frame.service_addr == self.addr());
            match index {
                Some(index) => batches.remove(index),
                None => panic!("end_task_batching called without an active batch"),
            }
        });

        let tasks = frame.tasks;
        // Dropping the compound without invoking it drops the collected
        // tasks, which runs each task's own cancellation hook.
        Task::new(move || {
            for task in tasks {
                task.invoke();
            }
        })
    }

    pub(crate) fn has_task_batching(&self) -> bool {
        BATCHES.with(|batches| {
            batches
                .borrow()
                .iter()
                .any(|frame| frame.service_addr == self.addr())
        })
    }

    /// Routes a posted task into the innermost active batch for this queue on
    /// this thread, if any. Returns the task back when there is none.
    fn try_append_to_batch(&self, task: Task) -> Option<Task> {
        BATCHES.with(|batches| {
            let mut batches = batches.borrow_mut();
            let frame = batches
                .iter_mut()
                .rev()
                .find(|frame| frame.service_addr == self.addr());
            match frame {
                Some(frame) => {
                    frame.tasks.push(task);
                    None
                }
                None => Some(task),
            }
        })
    }

    //=========================================================================
    // Queue-local values
    //=========================================================================

    /// Checks out the queue-local value slot for `key`, creating the value on
    /// first lock. Returns `None` if the slot is checked out elsewhere or the
    /// queue is shut down.
    pub(crate) fn try_lock_local<T: Default + Send + 'static>(
        &self,
        key: usize,
    ) -> Option<Box<T>> {
        if self.status() != QueueStatus::Active {
            return None;
        }
        match self.locals.entry(key) {
            Entry::Occupied(mut entry) => {
                match mem::replace(entry.get_mut(), LocalSlot::Locked) {
                    LocalSlot::Stored(value) => match value.downcast::<T>() {
                        Ok(value) => Some(value),
                        Err(_) => panic!("queue-local value type mismatch for key"),
                    },
                    // Already checked out; the entry stays Locked.
                    LocalSlot::Locked => None,
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(LocalSlot::Locked);
                Some(Box::new(T::default()))
            }
        }
    }

    /// Returns a checked-out value to its slot. If the queue was shut down in
    /// the meantime the value is destroyed instead, matching the shutdown
    /// teardown of stored locals.
    pub(crate) fn unlock_local(&self, key: usize, value: Box<dyn Any + Send>) {
        if self.status() != QueueStatus::Active {
            return;
        }
        self.locals.insert(key, LocalSlot::Stored(value));
    }

    //=========================================================================
    // Suspension
    //=========================================================================

    pub(crate) fn suspend(&self) {
        self.suspend_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn resume(&self) {
        let previous = self
            .suspend_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match previous {
            Ok(1) => {
                // Last resume; let tasks flow again.
                if self.has_dispatchable_tasks() {
                    self.scheduler.post();
                }
            }
            Ok(_) => {}
            Err(_) => panic!("unbalanced Resume on dispatch queue '{}'", self.name),
        }
    }

    //=========================================================================
    // Shutdown
    //=========================================================================

    pub(crate) fn shutdown(&self, action: PendingTaskAction) {
        let new_status = match action {
            PendingTaskAction::Complete => 1,
            PendingTaskAction::Cancel => 2,
        };
        if self
            .status
            .compare_exchange(0, new_status, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Only the first shutdown decides the pending-task policy.
            return;
        }

        tracing::debug!(queue = %self.name, ?action, "dispatch queue shutting down");

        match action {
            PendingTaskAction::Cancel => {
                let drained: Vec<Task> = self.tasks.lock().drain(..).collect();
                for task in drained {
                    task.cancel();
                }
            }
            PendingTaskAction::Complete => {
                if self.has_dispatchable_tasks() {
                    self.scheduler.post();
                }
            }
        }

        // Queue-local values die with the queue.
        self.locals.clear();

        self.scheduler.shutdown();
        self.maybe_signal_termination();
    }

    fn maybe_signal_termination(&self) {
        match self.status() {
            QueueStatus::Active => return,
            QueueStatus::ShutdownComplete => {
                if self.has_tasks() {
                    return;
                }
            }
            QueueStatus::ShutdownCancel => {}
        }
        if self.inflight.load(Ordering::Acquire) != 0 {
            return;
        }
        let mut terminated = self.terminated.lock();
        if !*terminated {
            *terminated = true;
            self.terminated_cv.notify_all();
        }
    }

    /// Blocks until every pending and in-flight task has finished being
    /// processed, then waits for the scheduler's own resources.
    pub(crate) fn await_termination(&self) {
        {
            let mut terminated = self.terminated.lock();
            while !*terminated {
                self.terminated_cv.wait(&mut terminated);
            }
        }
        self.scheduler.await_termination();
    }
}

impl Drop for QueueService {
    fn drop(&mut self) {
        // A queue dropped without an explicit shutdown cancels its pending
        // tasks so their cancellation hooks still run.
        let drained: Vec<Task> = self.tasks.lock().drain(..).collect();
        for task in drained {
            task.cancel();
        }
        self.scheduler.shutdown();
    }
}
