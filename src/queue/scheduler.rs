use crate::queue::WeakDispatchQueue;
use crate::queue::pool::shared_pool;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

/// How a dispatch queue's tasks get onto a thread.
///
/// A scheduler typically keeps the `WeakDispatchQueue` it receives in
/// [`DispatchScheduler::initialize`] and drives task processing by upgrading
/// it and calling `invoke_one_task`, `invoke_all_tasks`, or
/// `invoke_tasks_for` on the queue. Custom queues are created from a caller
/// implementation of this trait via `DispatchQueue::make_custom_queue`.
pub trait DispatchScheduler: Send + Sync + 'static {
    /// Called exactly once while the queue is being created, before any task
    /// can be posted.
    fn initialize(&mut self, queue: WeakDispatchQueue);

    /// True if the scheduler processes tasks in a serial order.
    fn is_serial(&self) -> bool;

    /// True if the queue is running on the current thread or permanently
    /// associated with it.
    fn has_thread_access(&self) -> bool;

    /// Schedule processing of the queue's pending tasks.
    fn post(&self);

    /// Initiate scheduler teardown and release its resources.
    fn shutdown(&self);

    /// Returns after the scheduler's resources are cleaned up.
    fn await_termination(&self);
}

//=============================================================================
// Thread-pool scheduler (serial and bounded-concurrency queues)
//=============================================================================

/// Runs drain passes on the shared process pool, at most `limit` at a time.
/// A limit of one yields a serial queue: one logical worker, FIFO order.
pub(crate) struct PoolScheduler {
    queue: WeakDispatchQueue,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl PoolScheduler {
    pub(crate) fn new(limit: usize) -> Self {
        debug_assert!(limit >= 1);
        Self {
            queue: WeakDispatchQueue::empty(),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    fn drain(queue: WeakDispatchQueue, active: Arc<AtomicUsize>) {
        if let Some(queue) = queue.upgrade() {
            let service = queue.service();
            service.begin_drain();
            while service.invoke_one_task(None) {}
            service.end_drain();

            active.fetch_sub(1, Ordering::AcqRel);

            // A task may have been posted between the final empty check and
            // the counter decrement; such a post saw the slot as taken, so it
            // is on us to reschedule.
            if service.has_dispatchable_tasks() {
                service.scheduler().post();
            }
        } else {
            active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl DispatchScheduler for PoolScheduler {
    fn initialize(&mut self, queue: WeakDispatchQueue) {
        self.queue = queue;
    }

    fn is_serial(&self) -> bool {
        self.limit == 1
    }

    fn has_thread_access(&self) -> bool {
        // Pool queues have no thread affinity beyond the task currently
        // running; the service's current-queue check covers that.
        false
    }

    fn post(&self) {
        loop {
            let active = self.active.load(Ordering::Acquire);
            if active >= self.limit {
                // A running drain pass will pick the task up, or reschedule
                // on its way out.
                return;
            }
            if self
                .active
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let queue = self.queue.clone();
        let active = self.active.clone();
        shared_pool().submit(Box::new(move || Self::drain(queue, active)));
    }

    fn shutdown(&self) {}

    fn await_termination(&self) {
        // Drain passes are accounted by the service; the pool itself is
        // process-wide and never torn down.
    }
}

//=============================================================================
// Looper scheduler (dedicated-thread queues)
//=============================================================================

struct LooperState {
    wake: bool,
    shutdown: bool,
}

struct LooperShared {
    queue: Mutex<WeakDispatchQueue>,
    state: Mutex<LooperState>,
    cv: Condvar,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Owns one dedicated thread for the queue's whole lifetime.
pub(crate) struct LooperScheduler {
    shared: Arc<LooperShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl LooperScheduler {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(LooperShared {
                queue: Mutex::new(WeakDispatchQueue::empty()),
                state: Mutex::new(LooperState {
                    wake: false,
                    shutdown: false,
                }),
                cv: Condvar::new(),
                thread_id: Mutex::new(None),
            }),
            join: Mutex::new(None),
        }
    }

    fn next_thread_name() -> String {
        static LOOPER_COUNT: AtomicUsize = AtomicUsize::new(0);
        let id = LOOPER_COUNT.fetch_add(1, Ordering::Relaxed);
        format!("strand-looper-{}", id)
    }

    fn run(shared: Arc<LooperShared>) {
        *shared.thread_id.lock() = Some(thread::current().id());
        loop {
            // Park before touching the queue: the thread starts while the
            // queue is still being constructed, and the weak reference only
            // upgrades once construction finished. The first post or the
            // shutdown wakes us.
            let shutdown_requested = {
                let mut state = shared.state.lock();
                while !state.wake && !state.shutdown {
                    shared.cv.wait(&mut state);
                }
                state.wake = false;
                state.shutdown
            };

            let weak = shared.queue.lock().clone();
            match weak.upgrade() {
                Some(queue) => queue.service().invoke_all_tasks(),
                None => return,
            }

            if shutdown_requested {
                return;
            }
        }
    }
}

impl DispatchScheduler for LooperScheduler {
    fn initialize(&mut self, queue: WeakDispatchQueue) {
        *self.shared.queue.lock() = queue;
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(Self::next_thread_name())
            .spawn(move || Self::run(shared));
        match spawned {
            Ok(handle) => *self.join.lock() = Some(handle),
            Err(error) => panic!("failed to spawn looper thread: {error}"),
        }
    }

    fn is_serial(&self) -> bool {
        true
    }

    fn has_thread_access(&self) -> bool {
        *self.shared.thread_id.lock() == Some(thread::current().id())
    }

    fn post(&self) {
        let mut state = self.shared.state.lock();
        state.wake = true;
        self.shared.cv.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        state.wake = true;
        self.shared.cv.notify_one();
    }

    fn await_termination(&self) {
        if self.has_thread_access() {
            // Joining the looper from its own thread would deadlock.
            return;
        }
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
