use crate::error::Maybe;
use crate::future::core::{Continuation, FutureCore, FutureOptions};
use crate::future::future::Future;
use std::sync::Arc;

/// Continuation attached to each parent of a `when_any` combinator. The
/// first settling parent wins the single `Pending → SettingResult`
/// transition; the others soft-fail and are dropped.
struct WhenAnySlot<T: Send + 'static> {
    target: Arc<FutureCore<T>>,
}

impl<T: Send + 'static> Continuation<T> for WhenAnySlot<T> {
    fn parent_settled(self: Box<Self>, input: Maybe<T>) {
        let error = input.error().cloned();
        if !self.target.try_settle(input, false) {
            // A losing error is dropped without anyone observing it.
            if let Some(error) = error {
                error.handle();
            }
        }
    }
}

/// Returns a future that settles with the result of whichever parent
/// settles first, value or error. Later settlements do not alter the
/// result. Which parent wins a same-instant tie is unspecified.
pub fn when_any<T: Send + 'static>(futures: Vec<Future<T>>) -> Future<T> {
    assert!(!futures.is_empty(), "when_any requires at least one future");

    let target = FutureCore::new(FutureOptions::IS_MULTI_POST);
    for future in futures.iter() {
        future.core().attach(Box::new(WhenAnySlot {
            target: target.clone(),
        }));
    }

    Future::from_core(target)
}
