use crate::error::{
    CanceledError, ErrorCode, Maybe, PanicError, cancellation_error_provider,
    panic_error_provider,
};
use crate::future::executor::Executor;
use crate::future::state::{CHAIN_DRAINED, FutureState, PackedState, STATE_MASK, Snapshot};
use crate::task::Task;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FutureOptions: u8 {
        /// Unbounded continuations; the result is cloned per consumer.
        const IS_SHARED = 1;
        /// Combinator mode: multiple parents may race to complete this core;
        /// the only transition is an inline first-writer-wins move from
        /// `Pending` into `SettingResult`.
        const IS_MULTI_POST = 1 << 1;
        /// Settle attached continuations with a cancellation error if the
        /// core is torn down unfulfilled.
        const CANCEL_IF_UNFULFILLED = 1 << 2;
    }
}

enum ResultSlot<T> {
    Empty,
    Set(Maybe<T>),
    Taken,
}

/// Work chained to run after a future settles. The committed result is
/// passed by value: a unique future moves it into its single continuation, a
/// shared future clones it per continuation.
pub(crate) trait Continuation<T>: Send {
    fn parent_settled(self: Box<Self>, input: Maybe<T>);
}

/// Intrusive node of the continuation chain. The alignment keeps the low
/// bits of node addresses free for the state tag in the packed word.
#[repr(align(8))]
struct ChainNode<T> {
    continuation: Box<dyn Continuation<T>>,
    next: *mut ChainNode<T>,
}

/// Heap state shared by every handle observing one deferred result: the
/// packed state word, the result storage and the option flags.
///
/// The result slot is valid for reading only after the packed word published
/// a terminal state; the thread that won the `SettingResult` claim has
/// exclusive write access until then. Continuation nodes are owned by the
/// packed word; the successful terminal CAS transfers the whole chain to the
/// settling thread, which drains it.
pub(crate) struct FutureCore<T> {
    packed: PackedState,
    options: FutureOptions,
    /// Present on shared cores. Clones the stored result for each consumer
    /// instead of moving it out.
    clone_result: Option<fn(&Maybe<T>) -> Maybe<T>>,
    result: Mutex<ResultSlot<T>>,
}

impl<T: Send + 'static> FutureCore<T> {
    pub(crate) fn new(options: FutureOptions) -> Arc<Self> {
        debug_assert!(!options.contains(FutureOptions::IS_SHARED));
        Arc::new(Self {
            packed: PackedState::new(FutureState::Pending),
            options,
            clone_result: None,
            result: Mutex::new(ResultSlot::Empty),
        })
    }

    pub(crate) fn new_shared(options: FutureOptions) -> Arc<Self>
    where
        T: Clone,
    {
        Arc::new(Self {
            packed: PackedState::new(FutureState::Pending),
            options: options | FutureOptions::IS_SHARED,
            clone_result: Some(|result| result.clone()),
            result: Mutex::new(ResultSlot::Empty),
        })
    }

    pub(crate) fn new_settled(result: Maybe<T>) -> Arc<Self> {
        let state = if result.is_error() {
            FutureState::Failed
        } else {
            FutureState::Succeeded
        };
        Arc::new(Self {
            packed: PackedState::new(state),
            options: FutureOptions::empty(),
            clone_result: None,
            result: Mutex::new(ResultSlot::Set(result)),
        })
    }

    //=========================================================================
    // Observers
    //=========================================================================

    pub(crate) fn is_done(&self) -> bool {
        self.packed.load().is_done()
    }

    pub(crate) fn is_succeeded(&self) -> bool {
        self.packed.load().state() == FutureState::Succeeded
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.packed.load().state() == FutureState::Failed
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.options.contains(FutureOptions::IS_SHARED)
    }

    /// Clones the committed error, if the future failed and the result was
    /// not moved out yet.
    pub(crate) fn peek_error(&self) -> Option<ErrorCode> {
        if !self.is_failed() {
            return None;
        }
        match &*self.result.lock() {
            ResultSlot::Set(Maybe::Error(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Clones the committed value of a succeeded future.
    pub(crate) fn peek_value(&self) -> Option<T>
    where
        T: Clone,
    {
        if !self.is_succeeded() {
            return None;
        }
        match &*self.result.lock() {
            ResultSlot::Set(Maybe::Value(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Hands the committed result to a consumer. Unique cores move it out;
    /// shared cores clone it and keep the original. Calling this before the
    /// future settled, or twice on a unique core, is a programmer error.
    fn consume_result(&self) -> Maybe<T> {
        let mut slot = self.result.lock();
        if let Some(clone_result) = self.clone_result {
            return match &*slot {
                ResultSlot::Set(result) => clone_result(result),
                _ => panic!("result is not initialized"),
            };
        }
        match mem::replace(&mut *slot, ResultSlot::Taken) {
            ResultSlot::Set(result) => result,
            ResultSlot::Empty => panic!("result is not initialized"),
            ResultSlot::Taken => panic!("result of a unique future was already consumed"),
        }
    }

    //=========================================================================
    // Continuation chain
    //=========================================================================

    /// Attaches a continuation, or runs it inline when the future already
    /// settled. At most one continuation may ever be attached unless the
    /// core is shared.
    pub(crate) fn attach(&self, continuation: Box<dyn Continuation<T>>) {
        let node = Box::into_raw(Box::new(ChainNode {
            continuation,
            next: ptr::null_mut(),
        }));
        debug_assert_eq!(node as usize & STATE_MASK, 0);

        let mut current = self.packed.load();
        loop {
            if current.is_done() {
                // Reclaim the node and run the continuation right away with
                // the committed result.
                let node = unsafe { Box::from_raw(node) };
                let input = self.consume_result();
                node.continuation.parent_settled(input);
                return;
            }

            let chain = current.chain_bits();
            if chain != 0 && !self.is_shared() {
                unsafe { drop(Box::from_raw(node)) };
                panic!("a continuation is already attached to this future");
            }

            unsafe { (*node).next = chain as *mut ChainNode<T> };
            let new = Snapshot::compose(current.state(), node as usize);
            match self.packed.try_swap(current, new) {
                // The packed word owns the node now.
                Ok(()) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Walks a chain the terminal CAS took ownership of, feeding each
    /// continuation the committed result.
    fn drain_chain(&self, head: usize) {
        let mut node_ptr = head as *mut ChainNode<T>;
        while !node_ptr.is_null() {
            let node = unsafe { Box::from_raw(node_ptr) };
            node_ptr = node.next;
            let input = self.consume_result();
            node.continuation.parent_settled(input);
        }
    }

    //=========================================================================
    // State transitions
    //=========================================================================

    fn transition(&self, from: FutureState, to: FutureState) {
        let mut current = self.packed.load();
        loop {
            let state = current.state();
            if state != from {
                panic!("future state is {state:?}; expected {from:?} to move to {to:?}");
            }
            let new = Snapshot::compose(to, current.chain_bits());
            match self.packed.try_swap(current, new) {
                Ok(()) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn start_posting(&self) {
        self.transition(FutureState::Pending, FutureState::Posting);
    }

    fn set_posted(&self) {
        self.transition(FutureState::Posting, FutureState::Posted);
    }

    /// Claims the exclusive right to run this future's task. Exactly one
    /// caller wins; a future already forced into a terminal state (e.g.
    /// canceled by the executor) reports false.
    fn try_start_invoking(&self) -> bool {
        let mut current = self.packed.load();
        loop {
            let state = current.state();
            match state {
                FutureState::Posted => {}
                FutureState::Succeeded | FutureState::Failed => return false,
                _ => panic!("cannot start invoking from state {state:?}"),
            }
            let new = Snapshot::compose(FutureState::Invoking, current.chain_bits());
            match self.packed.try_swap(current, new) {
                Ok(()) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn start_awaiting(&self) {
        self.transition(FutureState::Invoking, FutureState::Awaiting);
    }

    /// Claims the `SettingResult` state from one of `allowed`. Soft failure
    /// returns false when the future already settled (or is past the allowed
    /// states); `crash_if_failed` escalates that to a panic.
    fn try_claim_setting_result(
        &self,
        allowed: &[FutureState],
        crash_if_failed: bool,
    ) -> bool {
        let mut current = self.packed.load();
        loop {
            let state = current.state();
            if !allowed.contains(&state) {
                // Posting is transient: the driving thread is about to move
                // on. Wait it out rather than misreport a settled future.
                if state == FutureState::Posting {
                    std::thread::yield_now();
                    current = self.packed.load();
                    continue;
                }
                if crash_if_failed {
                    panic!("cannot set the result of a future in state {state:?}");
                }
                return false;
            }
            let new = Snapshot::compose(FutureState::SettingResult, current.chain_bits());
            match self.packed.try_swap(current, new) {
                Ok(()) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Commits the result and publishes the terminal state. Must only run on
    /// the thread that claimed `SettingResult`. The terminal CAS atomically
    /// swaps the continuation chain for the drained sentinel, and the chain
    /// is invoked after the result became observable.
    fn commit_result(&self, result: Maybe<T>) {
        let terminal = if result.is_error() {
            FutureState::Failed
        } else {
            FutureState::Succeeded
        };
        *self.result.lock() = ResultSlot::Set(result);

        let mut current = self.packed.load();
        loop {
            debug_assert_eq!(current.state(), FutureState::SettingResult);
            let chain = current.chain_bits();
            let published_chain = if chain != 0 { CHAIN_DRAINED } else { 0 };
            let new = Snapshot::compose(terminal, published_chain);
            match self.packed.try_swap(current, new) {
                Ok(()) => {
                    if chain != 0 && chain != CHAIN_DRAINED {
                        self.drain_chain(chain);
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Producer-side settle: valid while the future is still `Pending`
    /// (promises and multi-post combinators). Returns false on a soft
    /// double-settlement; panics when `crash_if_failed` is set.
    pub(crate) fn try_settle(&self, result: Maybe<T>, crash_if_failed: bool) -> bool {
        if !self.try_claim_setting_result(&[FutureState::Pending], crash_if_failed) {
            return false;
        }
        self.commit_result(result);
        true
    }

    fn settle_from_invoking(&self, result: Maybe<T>) {
        let claimed = self.try_claim_setting_result(&[FutureState::Invoking], true);
        debug_assert!(claimed);
        self.commit_result(result);
    }

    fn settle_from_awaiting(&self, result: Maybe<T>) {
        let claimed = self.try_claim_setting_result(&[FutureState::Awaiting], true);
        debug_assert!(claimed);
        self.commit_result(result);
    }

    /// Forces a posted future into a failed state after its executor
    /// discarded the invoke task; keeps an abandoned executor from leaving
    /// the future pending forever.
    fn try_cancel_posted(&self) -> bool {
        if !self.try_claim_setting_result(&[FutureState::Posted], false) {
            return false;
        }
        let error =
            cancellation_error_provider().make_error_code(CanceledError::TaskDiscarded);
        self.commit_result(Maybe::Error(error));
        true
    }

    //=========================================================================
    // Driving
    //=========================================================================

    /// Moves this core through `Posting`/`Posted` and hands the executor a
    /// task that runs `run` over the deposited input. If the executor drops
    /// the task without invoking it, the core fails with a cancellation
    /// error instead of hanging.
    pub(crate) fn drive<I, E, F>(self: &Arc<Self>, input: Maybe<I>, executor: E, run: F)
    where
        I: Send + 'static,
        E: Executor,
        F: FnOnce(Maybe<I>) -> TaskOutcome<T> + Send + 'static,
    {
        debug_assert!(
            !self.options.contains(FutureOptions::IS_MULTI_POST),
            "multi-post futures settle inline and are never posted"
        );
        self.start_posting();
        self.set_posted();

        let catches_panic = executor.catches_panic();
        let invoke_core = self.clone();
        let cancel_core = self.clone();
        let task = Task::with_cancel(
            move || invoke_core.invoke_with(input, run, catches_panic),
            move || {
                let _ = cancel_core.try_cancel_posted();
            },
        );
        executor.post_task(task);
    }

    fn invoke_with<I, F>(self: &Arc<Self>, input: Maybe<I>, run: F, catches_panic: bool)
    where
        I: Send + 'static,
        F: FnOnce(Maybe<I>) -> TaskOutcome<T> + Send + 'static,
    {
        if !self.try_start_invoking() {
            return;
        }
        match run_guarded(catches_panic, move || run(input)) {
            TaskOutcome::Result(result) => self.settle_from_invoking(result),
            TaskOutcome::Await(inner) => {
                // The callback returned another future; stay in `Awaiting`
                // and forward its result into this core when it settles.
                self.start_awaiting();
                inner.attach(Box::new(ForwardContinuation {
                    target: self.clone(),
                }));
            }
        }
    }
}

/// What a continuation callback produced: a settled result, or an inner
/// future whose completion must be chained before this core can settle.
pub(crate) enum TaskOutcome<T> {
    Result(Maybe<T>),
    Await(Arc<FutureCore<T>>),
}

fn run_guarded<T, F>(catches_panic: bool, run: F) -> TaskOutcome<T>
where
    F: FnOnce() -> TaskOutcome<T>,
{
    if !catches_panic {
        return run();
    }
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(outcome) => outcome,
        Err(payload) => TaskOutcome::Result(Maybe::Error(
            panic_error_provider().make_error_code(PanicError::from_payload(payload)),
        )),
    }
}

/// Hidden continuation forwarding an awaited inner future's result into the
/// outer core.
struct ForwardContinuation<T> {
    target: Arc<FutureCore<T>>,
}

impl<T: Send + 'static> Continuation<T> for ForwardContinuation<T> {
    fn parent_settled(self: Box<Self>, input: Maybe<T>) {
        self.target.settle_from_awaiting(input);
    }
}

/// Continuation binding a parent of type `T` to a child core of type `U`
/// through an executor and a callback-shape adapter.
pub(crate) struct ChildContinuation<T, U, E, F>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Executor,
    F: FnOnce(Maybe<T>) -> TaskOutcome<U> + Send + 'static,
{
    child: Arc<FutureCore<U>>,
    executor: E,
    run: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, U, E, F> ChildContinuation<T, U, E, F>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Executor,
    F: FnOnce(Maybe<T>) -> TaskOutcome<U> + Send + 'static,
{
    pub(crate) fn new(child: Arc<FutureCore<U>>, executor: E, run: F) -> Box<Self> {
        Box::new(Self {
            child,
            executor,
            run,
            _marker: PhantomData,
        })
    }
}

impl<T, U, E, F> Continuation<T> for ChildContinuation<T, U, E, F>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Executor,
    F: FnOnce(Maybe<T>) -> TaskOutcome<U> + Send + 'static,
{
    fn parent_settled(self: Box<Self>, input: Maybe<T>) {
        let this = *self;
        this.child.drive(input, this.executor, this.run);
    }
}

impl<T> Drop for FutureCore<T> {
    fn drop(&mut self) {
        let snapshot = self.packed.load();
        if snapshot.is_done() {
            debug_assert!(!snapshot.has_live_chain());
            return;
        }

        // Torn down unfulfilled. Resolve any attached continuations with a
        // cancellation error so the chain cannot hang; reaching this without
        // the cancel-if-unfulfilled option is a lifecycle bug upstream.
        let chain = snapshot.chain_bits();
        if chain != 0 && chain != CHAIN_DRAINED {
            debug_assert!(
                self.options.contains(FutureOptions::CANCEL_IF_UNFULFILLED),
                "future dropped unfulfilled with live continuations"
            );
            self.packed
                .store(Snapshot::compose(FutureState::Failed, CHAIN_DRAINED));
            let error =
                cancellation_error_provider().make_error_code(CanceledError::Abandoned);
            *self.result.lock() = ResultSlot::Set(Maybe::Error(error.clone()));

            let mut node_ptr = chain as *mut ChainNode<T>;
            while !node_ptr.is_null() {
                let node = unsafe { Box::from_raw(node_ptr) };
                node_ptr = node.next;
                node.continuation.parent_settled(Maybe::Error(error.clone()));
            }
        }
    }
}
