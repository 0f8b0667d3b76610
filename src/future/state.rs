use std::sync::atomic::{AtomicUsize, Ordering};

/// Lifecycle of a future.
///
/// Transitions are monotonic and never reverse:
/// `Pending → Posting → Posted → Invoking → {Awaiting} → SettingResult →
/// {Succeeded | Failed}`, with the shortcuts allowed by each operation.
/// Multi-post futures only ever move `Pending → SettingResult → terminal`,
/// inline, with the first CAS winning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum FutureState {
    Pending = 0,
    Posting = 1,
    Posted = 2,
    Invoking = 3,
    Awaiting = 4,
    SettingResult = 5,
    Succeeded = 6,
    Failed = 7,
}

impl FutureState {
    fn from_bits(bits: usize) -> FutureState {
        match bits {
            0 => FutureState::Pending,
            1 => FutureState::Posting,
            2 => FutureState::Posted,
            3 => FutureState::Invoking,
            4 => FutureState::Awaiting,
            5 => FutureState::SettingResult,
            6 => FutureState::Succeeded,
            7 => FutureState::Failed,
            _ => unreachable!("state tag is three bits"),
        }
    }

    pub(crate) fn is_done(self) -> bool {
        matches!(self, FutureState::Succeeded | FutureState::Failed)
    }
}

/// Low three bits carry the state tag; continuation-chain nodes are aligned
/// to eight bytes so the remaining bits hold the chain head pointer.
pub(crate) const STATE_MASK: usize = 0b111;
pub(crate) const CHAIN_MASK: usize = !STATE_MASK;

/// Placeholder chain value installed by the terminal transition after it took
/// ownership of the continuation list. Distinguishes "continuations were
/// drained" from "none were ever attached", which is what rejects a second
/// attachment on a unique future even after the first one already ran.
pub(crate) const CHAIN_DRAINED: usize = CHAIN_MASK;

/// One decoded observation of the packed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot(usize);

impl Snapshot {
    pub(crate) fn compose(state: FutureState, chain_bits: usize) -> Snapshot {
        debug_assert_eq!(chain_bits & STATE_MASK, 0, "chain pointer must be aligned");
        Snapshot(chain_bits | state as usize)
    }

    pub(crate) fn state(self) -> FutureState {
        FutureState::from_bits(self.0 & STATE_MASK)
    }

    pub(crate) fn chain_bits(self) -> usize {
        self.0 & CHAIN_MASK
    }

    pub(crate) fn has_live_chain(self) -> bool {
        let chain = self.chain_bits();
        chain != 0 && chain != CHAIN_DRAINED
    }

    pub(crate) fn is_done(self) -> bool {
        self.state().is_done()
    }
}

/// The future's state tag and continuation chain packed into one atomically
/// updated word, so both are read and replaced by a single compare-and-swap.
pub(crate) struct PackedState {
    data: AtomicUsize,
}

impl PackedState {
    pub(crate) fn new(state: FutureState) -> Self {
        Self {
            data: AtomicUsize::new(Snapshot::compose(state, 0).0),
        }
    }

    pub(crate) fn load(&self) -> Snapshot {
        Snapshot(self.data.load(Ordering::Acquire))
    }

    /// Single CAS step of a transition retry loop. On failure returns the
    /// freshly observed snapshot.
    pub(crate) fn try_swap(&self, current: Snapshot, new: Snapshot) -> Result<(), Snapshot> {
        match self.data.compare_exchange_weak(
            current.0,
            new.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(actual) => Err(Snapshot(actual)),
        }
    }

    /// Unconditional store; only sound where no other thread can hold a
    /// reference, e.g. in drop.
    pub(crate) fn store(&self, snapshot: Snapshot) {
        self.data.store(snapshot.0, Ordering::Release);
    }
}
