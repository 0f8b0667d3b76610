use crate::error::Maybe;
use crate::future::core::{ChildContinuation, FutureCore, FutureOptions, TaskOutcome};
use crate::future::executor::Inline;
use crate::future::future::Future;
use std::fmt;
use std::sync::Arc;

/// Tracks the set of source handles. When the last one goes away without an
/// explicit cancel or abandon, the root is abandoned: observers see `false`.
struct SourceGuard {
    root: Arc<FutureCore<bool>>,
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        let _ = self.root.try_settle(Maybe::Value(false), false);
    }
}

/// Owner side of a one-shot cancel-or-abandon signal.
///
/// The source strongly holds the root future of a two-future chain;
/// [`CancellationTokenSource::token`] hands out weak observers bound to the
/// second future, a registered continuation of the root. Clones share state:
/// the signal fires once, for everyone. Dropping every source clone without
/// calling [`CancellationTokenSource::cancel`] abandons the signal.
pub struct CancellationTokenSource {
    root: Arc<FutureCore<bool>>,
    observer: Arc<FutureCore<bool>>,
    sources: Arc<SourceGuard>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        let root = FutureCore::<bool>::new(FutureOptions::CANCEL_IF_UNFULFILLED);
        let observer = FutureCore::<bool>::new_shared(FutureOptions::empty());

        // The observer settles exactly when the root settles. Root
        // abandonment arrives as a cancellation error and reads as "not
        // canceled".
        root.attach(ChildContinuation::new(
            observer.clone(),
            Inline,
            |input: Maybe<bool>| {
                TaskOutcome::Result(match input {
                    Maybe::Value(canceled) => Maybe::Value(canceled),
                    Maybe::Error(error) => {
                        error.handle();
                        Maybe::Value(false)
                    }
                })
            },
        ));

        let sources = Arc::new(SourceGuard { root: root.clone() });
        Self {
            root,
            observer,
            sources,
        }
    }

    /// Fires the signal: observers see `true`, `when_canceled` actions run.
    /// Only the first of cancel/abandon wins; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        self.root.try_settle(Maybe::Value(true), false)
    }

    /// Retires the signal without canceling: observers see `false` and
    /// `when_canceled` actions never run. Called automatically when the last
    /// source clone is dropped.
    pub fn abandon(&self) -> bool {
        self.root.try_settle(Maybe::Value(false), false)
    }

    /// A weak observer of this signal. Tokens do not keep the source state
    /// alive: dropping every token has no effect on when abandonment fires.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            observer: self.observer.clone(),
        }
    }

    /// True if both handles share the same state instance.
    pub fn same_state(&self, other: &CancellationTokenSource) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CancellationTokenSource {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            observer: self.observer.clone(),
            sources: self.sources.clone(),
        }
    }
}

impl fmt::Debug for CancellationTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTokenSource")
            .field("settled", &self.root.is_done())
            .finish()
    }
}

/// Consumer side of the cancellation signal: poll with
/// [`CancellationToken::is_canceled`], or subscribe with
/// [`CancellationToken::when_canceled`] /
/// [`CancellationToken::when_changed`].
#[derive(Clone)]
pub struct CancellationToken {
    observer: Arc<FutureCore<bool>>,
}

impl CancellationToken {
    /// Non-blocking point query: true only after a cancel was signaled.
    pub fn is_canceled(&self) -> bool {
        self.observer.peek_value().unwrap_or(false)
    }

    /// A future resolving to `true` on cancel and `false` on abandonment.
    pub fn when_changed(&self) -> Future<bool> {
        let child = FutureCore::new(FutureOptions::empty());
        self.observer.attach(ChildContinuation::new(
            child.clone(),
            Inline,
            |input: Maybe<bool>| TaskOutcome::Result(input),
        ));
        Future::from_core(child)
    }

    /// Registers a fire-once action that runs only on the cancel path,
    /// never on abandonment.
    pub fn when_canceled(&self, action: impl FnOnce() + Send + 'static) {
        let child = FutureCore::<()>::new(FutureOptions::empty());
        self.observer.attach(ChildContinuation::new(
            child,
            Inline,
            move |input: Maybe<bool>| {
                if matches!(input, Maybe::Value(true)) {
                    action();
                }
                TaskOutcome::Result(Maybe::ok())
            },
        ));
    }

    /// True if both tokens observe the same signal.
    pub fn same_state(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.observer, &other.observer)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
