use crate::error::Maybe;
use crate::future::core::{Continuation, FutureCore, FutureOptions};
use crate::future::future::{Future, make_succeeded_future};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fan-in bookkeeping shared by the per-parent slots: one result slot per
/// parent plus the count of parents still outstanding.
struct WhenAllState<T> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
}

/// Continuation attached to one parent of a `when_all` combinator.
struct WhenAllSlot<T: Send + 'static> {
    state: Arc<WhenAllState<T>>,
    target: Arc<FutureCore<Vec<T>>>,
    index: usize,
}

impl<T: Send + 'static> Continuation<T> for WhenAllSlot<T> {
    fn parent_settled(self: Box<Self>, input: Maybe<T>) {
        match input {
            Maybe::Value(value) => {
                self.state.slots.lock()[self.index] = Some(value);
                // The last arriving parent completes the combinator. The
                // release/acquire pair on `remaining` orders every slot
                // write before the collection below.
                if self.state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values: Vec<T> = self
                        .state
                        .slots
                        .lock()
                        .iter_mut()
                        .map(|slot| slot.take().expect("every parent stored its value"))
                        .collect();
                    // All parents succeeded, so no error can have settled the
                    // combinator first; a failure here is a real defect.
                    self.target.try_settle(Maybe::Value(values), true);
                }
            }
            Maybe::Error(error) => {
                // First error wins; later errors are silently dropped even
                // when parents fail concurrently.
                let won = self.target.try_settle(Maybe::Error(error.clone()), false);
                if !won {
                    error.handle();
                }
            }
        }
    }
}

/// Returns a future that succeeds with every parent's value, in input order,
/// once all parents succeed, and fails with the first observed error
/// otherwise. An empty input yields an already-succeeded future.
pub fn when_all<T: Send + 'static>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
    if futures.is_empty() {
        return make_succeeded_future(Vec::new());
    }

    let count = futures.len();
    let target = FutureCore::new(FutureOptions::IS_MULTI_POST);
    let state = Arc::new(WhenAllState {
        slots: Mutex::new((0..count).map(|_| None).collect()),
        remaining: AtomicUsize::new(count),
    });

    // Parents may settle and run their slot inline while this loop is still
    // attaching the rest; the combinator state is ready for that.
    for (index, future) in futures.iter().enumerate() {
        future.core().attach(Box::new(WhenAllSlot {
            state: state.clone(),
            target: target.clone(),
            index,
        }));
    }

    Future::from_core(target)
}
