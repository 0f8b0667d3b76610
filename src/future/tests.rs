use super::*;
use crate::error::{
    CanceledError, E_FAIL, HResultError, Maybe, cancellation_error_provider,
    hresult_error_provider,
};
use crate::queue::{DispatchQueue, PendingTaskAction};
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

assert_impl_all!(Future<i32>: Send, Sync, Clone);
assert_impl_all!(SharedFuture<i32>: Send, Sync, Clone);
assert_impl_all!(Promise<i32>: Send, Sync, Clone);
assert_impl_all!(CancellationTokenSource: Send, Sync, Clone);
assert_impl_all!(CancellationToken: Send, Sync, Clone);

fn expected_failure() -> crate::error::ErrorCode {
    hresult_error_provider().make_error_code(HResultError::new(E_FAIL, "Expected Failure"))
}

//=============================================================================
// Creation and waiting
//=============================================================================

#[test]
fn test_post_future_runs_on_concurrent_executor() {
    let future = post_future(Concurrent, || Maybe::Value(21 * 2));
    assert_eq!(future.wait_result().into_value(), Some(42));
}

#[test]
fn test_post_future_inline_settles_synchronously() {
    let future = post_future(Inline, || Maybe::Value(7));
    assert!(future.is_done());
    assert!(future.is_succeeded());
    assert_eq!(future.wait_result().into_value(), Some(7));
}

#[test]
fn test_make_succeeded_and_failed_futures() {
    let succeeded = make_succeeded_future(5);
    assert!(succeeded.is_succeeded());
    assert_eq!(succeeded.wait_result().into_value(), Some(5));

    let failed = make_failed_future::<i32>(expected_failure());
    assert!(failed.is_failed());
    let error = failed.wait_result().into_error().expect("failed future");
    assert_eq!(error.to_string(), "[0x80004005] Expected Failure");
    error.handle();
}

#[test]
fn test_result_access_is_gated_on_is_done() {
    let promise = Promise::<i32>::new();
    let future = promise.as_future();
    assert!(!future.is_done());
    assert!(future.peek_error().is_none());

    promise.set_value(3);
    assert!(future.is_done());
    assert!(future.is_succeeded());
    assert_eq!(future.wait_result().into_value(), Some(3));
}

//=============================================================================
// Promise set-once law
//=============================================================================

#[test]
fn test_try_set_value_is_first_writer_wins() {
    let promise = Promise::<i32>::new();
    assert!(promise.try_set_value(1));
    assert!(!promise.try_set_value(2));
    assert!(!promise.try_set_error(expected_failure()));
    assert_eq!(promise.as_future().wait_result().into_value(), Some(1));
}

#[test]
#[should_panic(expected = "cannot set the result")]
fn test_double_set_value_is_fatal() {
    let promise = Promise::<i32>::new();
    promise.set_value(1);
    promise.set_value(2);
}

#[test]
fn test_promise_clones_share_state() {
    let promise = Promise::<i32>::new();
    let clone = promise.clone();
    assert!(promise.same_state(&clone));
    clone.set_value(9);
    assert!(!promise.try_set_value(10));
    assert_eq!(promise.as_future().wait_result().into_value(), Some(9));
}

#[test]
fn test_abandoned_promise_fails_with_cancellation() {
    let promise = Promise::<i32>::new();
    let future = promise.as_future();
    drop(promise);

    assert!(future.is_failed());
    let error = future.wait_result().into_error().expect("abandoned");
    let info = error
        .handle_as(cancellation_error_provider())
        .expect("cancellation-provider error");
    assert_eq!(*info, CanceledError::Abandoned);
}

#[test]
fn test_promise_try_cancel() {
    let promise = Promise::<i32>::new();
    assert!(promise.try_cancel());
    assert!(!promise.try_set_value(1));

    let error = promise.as_future().wait_result().into_error().expect("canceled");
    assert!(error.handle_as(cancellation_error_provider()).is_some());
}

//=============================================================================
// Continuations
//=============================================================================

#[test]
fn test_then_chain_propagates_values_across_queues() {
    let queue = DispatchQueue::make_serial_queue();

    let result = post_future(queue.clone(), || Maybe::Value(10))
        .then(queue.clone(), |input: Maybe<i32>| input.map(|v| v + 1))
        .map(queue.clone(), |v| v * 2)
        .wait_result();
    assert_eq!(result.into_value(), Some(22));

    queue.shutdown(PendingTaskAction::Complete);
    queue.await_termination();
}

#[test]
fn test_map_never_sees_the_error_channel() {
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();

    let future = make_failed_future::<i32>(expected_failure()).map(Inline, move |v| {
        r.fetch_add(1, Ordering::SeqCst);
        v + 1
    });

    let error = future.wait_result().into_error().expect("error forwarded");
    assert_eq!(error.to_string(), "[0x80004005] Expected Failure");
    error.handle();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_then_observes_a_failed_parent() {
    let observed = make_failed_future::<i32>(expected_failure())
        .then(Inline, |input: Maybe<i32>| {
            let recovered = match input {
                Maybe::Value(v) => v,
                Maybe::Error(error) => {
                    error.handle();
                    -1
                }
            };
            Maybe::Value(recovered)
        })
        .wait_result();
    assert_eq!(observed.into_value(), Some(-1));
}

#[test]
fn test_catch_runs_only_on_error() {
    let caught = Arc::new(AtomicUsize::new(0));

    let c = caught.clone();
    let recovered = make_failed_future::<i32>(expected_failure())
        .catch(Inline, move |error| {
            error.handle();
            c.fetch_add(1, Ordering::SeqCst);
            Maybe::Value(0)
        })
        .wait_result();
    assert_eq!(recovered.into_value(), Some(0));
    assert_eq!(caught.load(Ordering::SeqCst), 1);

    let c = caught.clone();
    let untouched = make_succeeded_future(5)
        .catch(Inline, move |error| {
            error.handle();
            c.fetch_add(1, Ordering::SeqCst);
            Maybe::Value(0)
        })
        .wait_result();
    assert_eq!(untouched.into_value(), Some(5));
    assert_eq!(caught.load(Ordering::SeqCst), 1);
}

#[test]
fn test_and_then_future_chains_through_awaiting() {
    let result = post_future(Inline, || Maybe::Value(3))
        .and_then_future(Inline, |v| {
            post_future(Inline, move || Maybe::Value(v * 10))
        })
        .wait_result();
    assert_eq!(result.into_value(), Some(30));
}

#[test]
fn test_and_then_future_with_pending_inner_future() {
    let inner_promise = Promise::<i32>::new();
    let inner = inner_promise.as_future();

    let outer = post_future(Inline, || Maybe::Value(())).and_then_future(Inline, move |_| inner);
    assert!(!outer.is_done());

    inner_promise.set_value(77);
    assert_eq!(outer.wait_result().into_value(), Some(77));
}

#[test]
#[should_panic(expected = "already attached")]
fn test_second_continuation_on_unique_future_is_fatal() {
    let promise = Promise::<i32>::new();
    let future = promise.as_future();
    let _first = future.map(Inline, |v| v);
    let _second = future.map(Inline, |v| v);
}

#[test]
fn test_shared_future_allows_multiple_continuations() {
    let promise = Promise::<i32>::new();
    let shared = promise.as_future().share();

    let first = shared.map(Inline, |v| v + 1);
    let second = shared.map(Inline, |v| v + 2);

    promise.set_value(10);
    assert_eq!(first.wait_result().into_value(), Some(11));
    assert_eq!(second.wait_result().into_value(), Some(12));
    assert_eq!(shared.peek_value(), Some(10));
}

#[test]
fn test_throwing_executor_converts_panic_to_error() {
    let future = post_future(Throwing(Inline), || -> Maybe<i32> {
        panic!("callback exploded");
    });

    let error = future.wait_result().into_error().expect("panic captured");
    let info = error
        .handle_as(crate::error::panic_error_provider())
        .expect("panic-provider error");
    assert!(info.message.contains("callback exploded"));
}

//=============================================================================
// Combinators
//=============================================================================

#[test]
fn test_when_all_of_nothing_succeeds_immediately() {
    let future = when_all::<i32>(Vec::new());
    assert!(future.is_succeeded());
    assert_eq!(future.wait_result().into_value(), Some(Vec::new()));
}

#[test]
fn test_when_all_collects_values_in_input_order() {
    let promises: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
    let combined = when_all(promises.iter().map(|p| p.as_future()).collect());

    // Out-of-order completion must not affect result order.
    promises[2].set_value(30);
    assert!(!combined.is_done());
    promises[0].set_value(10);
    promises[1].set_value(20);

    assert_eq!(
        combined.wait_result().into_value(),
        Some(vec![10, 20, 30])
    );
}

#[test]
fn test_when_all_fails_with_first_observed_error() {
    let promises: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
    let combined = when_all(promises.iter().map(|p| p.as_future()).collect());

    promises[1].set_error(expected_failure());
    promises[2].set_error(
        hresult_error_provider().make_error_code(HResultError::new(0x8000_ffff, "later")),
    );
    promises[0].set_value(1);

    let error = combined.wait_result().into_error().expect("combined failed");
    let info = error.handle_as(hresult_error_provider()).expect("hresult");
    assert_eq!(info.message, "Expected Failure");
}

#[test]
fn test_when_all_completes_across_queues() {
    let queue = DispatchQueue::make_concurrent_queue(4);
    let futures: Vec<Future<usize>> = (0..8)
        .map(|i| post_future(queue.clone(), move || Maybe::Value(i)))
        .collect();

    let values = when_all(futures).wait_result().into_value().expect("all ran");
    assert_eq!(values, (0..8).collect::<Vec<_>>());

    queue.shutdown(PendingTaskAction::Complete);
    queue.await_termination();
}

#[test]
fn test_when_any_resolves_on_first_settlement() {
    let promises: Vec<Promise<i32>> = (0..3).map(|_| Promise::new()).collect();
    let first = when_any(promises.iter().map(|p| p.as_future()).collect());

    promises[1].set_value(5);
    assert_eq!(first.peek_error().is_some(), false);
    assert!(first.is_succeeded());

    // Later settlements must neither crash nor alter the result.
    promises[0].set_value(6);
    promises[2].set_error(expected_failure());

    assert_eq!(first.wait_result().into_value(), Some(5));
}

#[test]
fn test_when_any_propagates_a_first_error() {
    let promises: Vec<Promise<i32>> = (0..2).map(|_| Promise::new()).collect();
    let first = when_any(promises.iter().map(|p| p.as_future()).collect());

    promises[0].set_error(expected_failure());
    promises[1].set_value(1);

    let error = first.wait_result().into_error().expect("first was an error");
    error.handle();
}

#[test]
#[should_panic(expected = "at least one future")]
fn test_when_any_of_nothing_is_fatal() {
    let _ = when_any::<i32>(Vec::new());
}

//=============================================================================
// Cancellation
//=============================================================================

#[test]
fn test_cancel_is_observed_by_tokens() {
    let source = CancellationTokenSource::new();
    let token = source.token();
    assert!(!token.is_canceled());

    assert!(source.cancel());
    assert!(token.is_canceled());
}

#[test]
fn test_when_canceled_fires_exactly_once_on_cancel() {
    let source = CancellationTokenSource::new();
    let token = source.token();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    token.when_canceled(move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    source.cancel();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // A second cancel is a no-op.
    assert!(!source.cancel());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_sources_abandons_without_firing() {
    let fired = Arc::new(AtomicUsize::new(0));

    let token = {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let f = fired.clone();
        token.when_canceled(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        token
    };

    assert!(!token.is_canceled());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_when_changed_reports_cancel_and_abandon() {
    let canceled_source = CancellationTokenSource::new();
    let canceled_change = canceled_source.token().when_changed();
    canceled_source.cancel();
    assert_eq!(canceled_change.wait_result().into_value(), Some(true));

    let abandoned_source = CancellationTokenSource::new();
    let abandoned_change = abandoned_source.token().when_changed();
    drop(abandoned_source);
    assert_eq!(abandoned_change.wait_result().into_value(), Some(false));
}

#[test]
fn test_source_clones_share_the_signal() {
    let source = CancellationTokenSource::new();
    let clone = source.clone();
    assert!(source.same_state(&clone));

    let token = source.token();
    drop(source);
    // One source clone is still alive; the signal is not abandoned yet.
    assert!(!token.is_canceled());
    clone.cancel();
    assert!(token.is_canceled());
}

#[test]
fn test_subscription_after_cancel_fires_inline() {
    let source = CancellationTokenSource::new();
    source.cancel();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    source.token().when_canceled(move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

//=============================================================================
// Cross-thread behavior
//=============================================================================

#[test]
fn test_wait_result_blocks_until_posted_completion() {
    let queue = DispatchQueue::make_serial_queue();
    let (sender, receiver) = mpsc::channel();

    let future = post_future(queue.clone(), move || {
        // Hold the producer long enough that the consumer actually waits.
        let _ = receiver.recv_timeout(Duration::from_secs(5));
        Maybe::Value(123)
    });

    let _ = sender.send(());
    assert_eq!(future.wait_result().into_value(), Some(123));

    queue.shutdown(PendingTaskAction::Complete);
    queue.await_termination();
}

#[test]
fn test_shutdown_cancel_forces_posted_future_into_failure() {
    let queue = DispatchQueue::make_serial_queue();
    let guard = queue.suspend();

    let future = post_future(queue.clone(), || Maybe::Value(1));
    queue.shutdown(PendingTaskAction::Cancel);
    queue.await_termination();
    drop(guard);

    let error = future.wait_result().into_error().expect("task was discarded");
    let info = error
        .handle_as(cancellation_error_provider())
        .expect("cancellation-provider error");
    assert_eq!(*info, CanceledError::TaskDiscarded);
}
