use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

pub(crate) type PoolJob = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide worker pool backing the serial and concurrent dispatch
/// queues. Created on demand; lives for the rest of the process, like the
/// global concurrent queue it serves.
pub(crate) struct ThreadPool {
    injector: Injector<PoolJob>,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    worker_count: usize,
}

impl ThreadPool {
    pub(crate) fn submit(&'static self, job: PoolJob) {
        self.injector.push(job);
        // Hold the idle lock while notifying so a worker between its steal
        // re-check and its wait cannot miss the wakeup.
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_one();
    }

    /// Concurrency limit used when a concurrent queue is created with a
    /// max-threads value of zero.
    pub(crate) fn default_concurrency(&self) -> usize {
        self.worker_count
    }

    fn worker_loop(&'static self) {
        loop {
            loop {
                match self.injector.steal() {
                    Steal::Success(job) => run_job(job),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }

            let mut guard = self.idle_lock.lock();
            match self.injector.steal() {
                Steal::Success(job) => {
                    drop(guard);
                    run_job(job);
                }
                Steal::Empty | Steal::Retry => {
                    self.idle_cv.wait(&mut guard);
                }
            }
        }
    }
}

/// Tasks are required not to panic; if one does anyway, the worker must
/// survive it, or the pool would silently lose capacity for the rest of the
/// process.
fn run_job(job: PoolJob) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("dispatch task panicked; the worker keeps running");
    }
}

fn next_worker_name() -> String {
    static WORKER_COUNT: AtomicUsize = AtomicUsize::new(0);
    let id = WORKER_COUNT.fetch_add(1, Ordering::Relaxed);
    format!("strand-pool-{}", id)
}

pub(crate) fn shared_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        let worker_count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        ThreadPool {
            injector: Injector::new(),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            worker_count,
        }
    });

    static WORKERS_STARTED: OnceLock<()> = OnceLock::new();
    WORKERS_STARTED.get_or_init(|| {
        for _ in 0..pool.worker_count {
            let spawned = thread::Builder::new()
                .name(next_worker_name())
                .spawn(move || pool.worker_loop());
            if let Err(error) = spawned {
                panic!("failed to spawn dispatch pool worker: {error}");
            }
        }
    });

    pool
}
