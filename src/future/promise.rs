use crate::error::{CanceledError, ErrorCode, Maybe, cancellation_error_provider};
use crate::future::core::{FutureCore, FutureOptions};
use crate::future::future::Future;
use std::fmt;
use std::sync::Arc;

/// Tracks the producer side of a promise. When the last producer handle is
/// gone without the promise having been settled, the future is abandoned:
/// it fails with a cancellation error so attached continuations resolve.
struct ProducerGuard<T: Send + 'static> {
    core: Arc<FutureCore<T>>,
}

impl<T: Send + 'static> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        if !self.core.is_done() {
            let error =
                cancellation_error_provider().make_error_code(CanceledError::Abandoned);
            let _ = self.core.try_settle(Maybe::Error(error), false);
        }
    }
}

/// Write-side handle used to settle a [`Future`] exactly once.
///
/// The `set_*` methods treat double settlement as a programmer error and
/// panic; the `try_*` variants return `false` instead, for call sites that
/// legitimately race (first writer wins). Dropping every clone of a promise
/// without settling it abandons the future.
pub struct Promise<T: Send + 'static> {
    core: Arc<FutureCore<T>>,
    producers: Arc<ProducerGuard<T>>,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        let core = FutureCore::new(FutureOptions::CANCEL_IF_UNFULFILLED);
        let producers = Arc::new(ProducerGuard { core: core.clone() });
        Self { core, producers }
    }

    /// The read side of this promise.
    pub fn as_future(&self) -> Future<T> {
        Future::from_core(self.core.clone())
    }

    /// Sets the value and completes the promise. Panics if the promise was
    /// already settled or abandoned.
    #[track_caller]
    pub fn set_value(&self, value: T) {
        self.core.try_settle(Maybe::Value(value), true);
    }

    /// Tries to set the value. Returns false if the promise was already
    /// settled or abandoned.
    pub fn try_set_value(&self, value: T) -> bool {
        self.core.try_settle(Maybe::Value(value), false)
    }

    /// Fails the promise with the given error. Panics on double settlement.
    #[track_caller]
    pub fn set_error(&self, error: ErrorCode) {
        self.core.try_settle(Maybe::Error(error), true);
    }

    pub fn try_set_error(&self, error: ErrorCode) -> bool {
        self.core.try_settle(Maybe::Error(error), false)
    }

    /// Settles the promise with a full result. Panics on double settlement.
    #[track_caller]
    pub fn set_maybe(&self, result: Maybe<T>) {
        self.core.try_settle(result, true);
    }

    pub fn try_set_maybe(&self, result: Maybe<T>) -> bool {
        self.core.try_settle(result, false)
    }

    /// Tries to fail the promise with a cancellation error. Returns false if
    /// it already settled.
    pub fn try_cancel(&self) -> bool {
        let error = cancellation_error_provider().make_error_code(CanceledError::Canceled);
        self.core.try_settle(Maybe::Error(error), false)
    }

    /// True if this promise has settled, either way.
    pub fn is_done(&self) -> bool {
        self.core.is_done()
    }

    /// True if both handles share the same state instance.
    pub fn same_state(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            producers: self.producers.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}
