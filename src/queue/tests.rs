use super::*;
use crate::task::Task;
use parking_lot::Mutex as PlMutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

assert_impl_all!(DispatchQueue: Send, Sync, Clone);
assert_impl_all!(SuspendGuard: Send);
assert_impl_all!(WeakDispatchQueue: Send, Sync, Clone);

const WAIT: Duration = Duration::from_secs(5);
const SHOULD_NOT_HAPPEN: Duration = Duration::from_millis(200);

fn drain_and_join(queue: &DispatchQueue) {
    queue.shutdown(PendingTaskAction::Complete);
    queue.await_termination();
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    Serial,
    Looper,
    ConcurrentOne,
}

fn make_queue(kind: QueueKind) -> DispatchQueue {
    match kind {
        QueueKind::Serial => DispatchQueue::make_serial_queue(),
        QueueKind::Looper => DispatchQueue::make_looper_queue(),
        QueueKind::ConcurrentOne => DispatchQueue::make_concurrent_queue(1),
    }
}

#[rstest]
#[case::serial(QueueKind::Serial)]
#[case::looper(QueueKind::Looper)]
#[case::concurrent_of_one(QueueKind::ConcurrentOne)]
fn test_serial_queue_runs_tasks_in_submission_order(#[case] kind: QueueKind) {
    let queue = make_queue(kind);
    assert!(queue.is_serial());

    let order = Arc::new(PlMutex::new(Vec::new()));
    for i in 0..50usize {
        let order = order.clone();
        queue.post(Task::new(move || {
            order.lock().push(i);
        }));
    }

    drain_and_join(&queue);
    let order = order.lock();
    assert_eq!(*order, (0..50).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_queue_completes_all_tasks() {
    let queue = DispatchQueue::make_concurrent_queue(4);
    assert!(!queue.is_serial());

    let (sender, receiver) = mpsc::channel();
    for i in 0..16usize {
        let sender = sender.clone();
        queue.post(Task::new(move || {
            let _ = sender.send(i);
        }));
    }

    let mut seen: Vec<usize> = (0..16)
        .map(|_| receiver.recv_timeout(WAIT).expect("task ran"))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..16).collect::<Vec<_>>());
    drain_and_join(&queue);
}

#[test]
fn test_invoke_else_post_runs_inline_on_current_queue() {
    let queue = DispatchQueue::make_serial_queue();
    let order = Arc::new(PlMutex::new(Vec::new()));

    let (sender, receiver) = mpsc::channel();
    {
        let queue = queue.clone();
        let order = order.clone();
        let inner_queue = queue.clone();
        queue.post(Task::new(move || {
            assert!(inner_queue.is_current_queue());
            let inline_order = order.clone();
            inner_queue.invoke_else_post(Task::new(move || {
                inline_order.lock().push("inline");
            }));
            order.lock().push("after");
            let _ = sender.send(());
        }));
    }

    receiver.recv_timeout(WAIT).expect("task ran");
    assert_eq!(*order.lock(), vec!["inline", "after"]);
    drain_and_join(&queue);
}

#[test]
fn test_invoke_else_post_posts_from_foreign_thread() {
    let queue = DispatchQueue::make_serial_queue();
    assert!(!queue.is_current_queue());

    let (sender, receiver) = mpsc::channel();
    queue.invoke_else_post(Task::new(move || {
        let _ = sender.send(());
    }));
    receiver.recv_timeout(WAIT).expect("task posted and ran");
    drain_and_join(&queue);
}

#[test]
fn test_defer_else_post_runs_after_current_task_before_posted_work() {
    let queue = DispatchQueue::make_serial_queue();
    let order = Arc::new(PlMutex::new(Vec::new()));

    let (sender, receiver) = mpsc::channel();
    {
        let order = order.clone();
        let inner_queue = queue.clone();
        queue.post(Task::new(move || {
            let deferred_order = order.clone();
            inner_queue.defer_else_post(Task::new(move || {
                deferred_order.lock().push("deferred");
            }));

            let posted_order = order.clone();
            let posted_sender = sender.clone();
            inner_queue.post(Task::new(move || {
                posted_order.lock().push("posted");
                let _ = posted_sender.send(());
            }));

            order.lock().push("body");
        }));
    }

    receiver.recv_timeout(WAIT).expect("posted task ran");
    assert_eq!(*order.lock(), vec!["body", "deferred", "posted"]);
    drain_and_join(&queue);
}

#[test]
fn test_defer_else_post_posts_from_foreign_thread() {
    let queue = DispatchQueue::make_serial_queue();
    let (sender, receiver) = mpsc::channel();
    queue.defer_else_post(Task::new(move || {
        let _ = sender.send(());
    }));
    receiver.recv_timeout(WAIT).expect("task posted and ran");
    drain_and_join(&queue);
}

#[test]
fn test_suspend_withholds_dispatch_until_resume() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();

    let (sender, receiver) = mpsc::channel();
    queue.post(Task::new(move || {
        let _ = sender.send(());
    }));

    assert!(receiver.recv_timeout(SHOULD_NOT_HAPPEN).is_err());
    guard.resume();
    receiver.recv_timeout(WAIT).expect("task ran after resume");
    drain_and_join(&queue);
}

#[test]
fn test_suspend_guard_clones_must_all_release() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();
    let clone = guard.clone();

    let (sender, receiver) = mpsc::channel();
    queue.post(Task::new(move || {
        let _ = sender.send(());
    }));

    drop(guard);
    assert!(receiver.recv_timeout(SHOULD_NOT_HAPPEN).is_err());

    drop(clone);
    receiver.recv_timeout(WAIT).expect("task ran after last resume");
    drain_and_join(&queue);
}

#[test]
fn test_shutdown_cancel_invokes_cancellation_hooks() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();

    let invoked = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));
    let (i, c) = (invoked.clone(), canceled.clone());
    queue.post(Task::with_cancel(
        move || {
            i.fetch_add(1, Ordering::SeqCst);
        },
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
    ));

    queue.shutdown(PendingTaskAction::Cancel);
    queue.await_termination();
    drop(guard);

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_complete_runs_pending_tasks() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();

    let invoked = Arc::new(AtomicUsize::new(0));
    let i = invoked.clone();
    queue.post(Task::new(move || {
        i.fetch_add(1, Ordering::SeqCst);
    }));

    queue.shutdown(PendingTaskAction::Complete);
    guard.resume();
    queue.await_termination();

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_post_after_shutdown_cancels_task() {
    let queue = DispatchQueue::make_serial_queue();
    queue.shutdown(PendingTaskAction::Complete);
    queue.await_termination();

    let invoked = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));
    let (i, c) = (invoked.clone(), canceled.clone());
    queue.post(Task::with_cancel(
        move || {
            i.fetch_add(1, Ordering::SeqCst);
        },
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
    ));

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
}

#[test]
fn test_task_batching_posts_batch_as_single_task() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();
    let order = Arc::new(PlMutex::new(Vec::new()));

    {
        let batch = queue.start_task_batching();
        assert!(queue.has_task_batching());
        for i in 0..3usize {
            let order = order.clone();
            queue.post(Task::new(move || {
                order.lock().push(i);
            }));
        }
        // Batched posts never reached the queue itself.
        assert!(!queue.has_tasks());
        batch.post();
    }
    assert!(!queue.has_task_batching());
    assert!(queue.has_tasks());

    guard.resume();
    drain_and_join(&queue);
    assert_eq!(*order.lock(), vec![0, 1, 2]);
}

#[test]
fn test_task_batching_drop_auto_posts() {
    let queue = DispatchQueue::make_serial_queue();
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let _batch = queue.start_task_batching();
        let r = ran.clone();
        queue.post(Task::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
    }

    drain_and_join(&queue);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_task_batching_cancel_runs_hooks() {
    let queue = DispatchQueue::make_serial_queue();
    let invoked = Arc::new(AtomicUsize::new(0));
    let canceled = Arc::new(AtomicUsize::new(0));

    {
        let batch = queue.start_task_batching();
        let (i, c) = (invoked.clone(), canceled.clone());
        queue.post(Task::with_cancel(
            move || {
                i.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        ));
        batch.cancel();
    }

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(canceled.load(Ordering::SeqCst), 1);
    drain_and_join(&queue);
}

static COUNTER_SLOT: QueueLocalKey<u64> = QueueLocalKey::new();
static LOCKED_SLOT: QueueLocalKey<u64> = QueueLocalKey::new();

#[test]
fn test_queue_local_value_persists_across_locks() {
    let queue = DispatchQueue::make_serial_queue();

    {
        let mut value = queue
            .try_lock_local_value(&COUNTER_SLOT)
            .expect("first lock creates the value");
        assert_eq!(*value, 0);
        *value = 41;
    }
    {
        let mut value = queue
            .try_lock_local_value(&COUNTER_SLOT)
            .expect("relock sees the stored value");
        assert_eq!(*value, 41);
        *value += 1;
    }
    {
        let value = queue
            .try_lock_local_value(&COUNTER_SLOT)
            .expect("relock sees the stored value");
        assert_eq!(*value, 42);
    }

    drain_and_join(&queue);
}

#[test]
fn test_queue_local_value_lock_is_exclusive() {
    let queue = DispatchQueue::make_serial_queue();

    let held = queue
        .try_lock_local_value(&LOCKED_SLOT)
        .expect("first lock succeeds");
    assert!(queue.try_lock_local_value(&LOCKED_SLOT).is_none());
    drop(held);
    assert!(queue.try_lock_local_value(&LOCKED_SLOT).is_some());

    drain_and_join(&queue);
}

#[test]
fn test_should_yield_reports_suspension_and_shutdown() {
    let queue = DispatchQueue::make_serial_queue();
    assert_eq!(queue.should_yield(), None);

    let guard = queue.suspend();
    assert_eq!(queue.should_yield(), Some(TaskYieldReason::QueueSuspended));
    guard.resume();

    queue.shutdown(PendingTaskAction::Complete);
    assert_eq!(queue.should_yield(), Some(TaskYieldReason::QueueShutdown));
    queue.await_termination();
}

#[test]
fn test_looper_queue_has_thread_access_inside_tasks() {
    let queue = DispatchQueue::make_looper_queue();
    assert!(!queue.has_thread_access());

    let (sender, receiver) = mpsc::channel();
    {
        let inner_queue = queue.clone();
        queue.post(Task::new(move || {
            let _ = sender.send(inner_queue.has_thread_access());
        }));
    }
    assert!(receiver.recv_timeout(WAIT).expect("task ran"));
    drain_and_join(&queue);
}

#[test]
fn test_current_queue_is_set_only_inside_tasks() {
    let queue = DispatchQueue::make_serial_queue();
    assert!(DispatchQueue::current_queue().is_none());

    let (sender, receiver) = mpsc::channel();
    {
        let inner_queue = queue.clone();
        queue.post(Task::new(move || {
            let current = DispatchQueue::current_queue();
            let _ = sender.send(current == Some(inner_queue.clone()));
        }));
    }
    assert!(receiver.recv_timeout(WAIT).expect("task ran"));
    drain_and_join(&queue);
}

/// Scheduler that drains the queue inline from `post`, so tasks run on the
/// posting thread. Exercises the custom-scheduler surface end to end.
struct InlineScheduler {
    queue: PlMutex<WeakDispatchQueue>,
}

impl DispatchScheduler for InlineScheduler {
    fn initialize(&mut self, queue: WeakDispatchQueue) {
        *self.queue.lock() = queue;
    }

    fn is_serial(&self) -> bool {
        true
    }

    fn has_thread_access(&self) -> bool {
        true
    }

    fn post(&self) {
        let weak = self.queue.lock().clone();
        if let Some(queue) = weak.upgrade() {
            queue.invoke_all_tasks();
        }
    }

    fn shutdown(&self) {}

    fn await_termination(&self) {}
}

#[test]
fn test_custom_scheduler_drives_queue() {
    let queue = DispatchQueue::make_custom_queue(Box::new(InlineScheduler {
        queue: PlMutex::new(WeakDispatchQueue::empty()),
    }));
    assert!(queue.is_serial());

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    queue.post(Task::new(move || {
        r.fetch_add(1, Ordering::SeqCst);
    }));

    // The inline scheduler ran the task during post.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    drain_and_join(&queue);
}

#[test]
fn test_ui_thread_queue_registration() {
    // No dispatcher is registered by default; hosts install one explicitly.
    assert!(DispatchQueue::ui_thread_queue().is_none());

    let queue = DispatchQueue::make_looper_queue();
    assert!(DispatchQueue::register_ui_thread_queue(queue.clone()).is_none());
    assert_eq!(DispatchQueue::ui_thread_queue(), Some(queue.clone()));

    let previous = DispatchQueue::register_ui_thread_queue(queue.clone());
    assert_eq!(previous, Some(queue.clone()));
    drain_and_join(&queue);
}

#[test]
fn test_queue_identity_and_equality() {
    let first = DispatchQueue::make_serial_queue();
    let second = DispatchQueue::make_serial_queue();
    let first_clone = first.clone();

    assert_eq!(first, first_clone);
    assert_ne!(first, second);

    drain_and_join(&first);
    drain_and_join(&second);
}
