//! Carrier threads and blocking compensation.
//!
//! A carrier is a pool worker that lightweight tasks are multiplexed onto.
//! When the task a carrier is running is about to block in a syscall, the
//! carrier "steps aside": it asks the backing pool to reserve or spin up a
//! replacement worker so real parallelism is preserved while it blocks, and
//! releases the reservation symmetrically when the blocking call returns.
//!
//! The state machine is strictly per-thread. A [`CarrierThread`] is
//! installed into thread-local storage by the hosting executor and only
//! ever touched by its own thread, so the state lives in plain `Cell`s.

pub mod blocker;

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::utils::ScopeGuard;

/// Opaque proof of a reserved compensating worker, handed back to the pool
/// on release. Meaningful only while its carrier is compensating.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CompensationToken(u64);

impl CompensationToken {
    pub fn new(raw: u64) -> Self {
        CompensationToken(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The backing pool's compensation interface, supplied by whatever executor
/// hosts the carrier threads.
pub trait CompensationPool: Send + Sync {
    /// Reserves or spins up a replacement worker. May block briefly while
    /// negotiating with the pool.
    fn try_reserve(&self) -> Result<CompensationToken, CompensationError>;

    /// Releases a previously reserved replacement worker.
    fn release(&self, token: CompensationToken);
}

#[derive(thiserror::Error, Debug)]
pub enum CompensationError {
    /// The backing pool is shutting down and will not grow.
    #[error("backing pool is shutting down")]
    PoolShutdown,

    /// The backing pool is at its growth limit.
    #[error("backing pool has no capacity for a compensating worker")]
    Exhausted,

    /// Any other failure surfaced by the pool implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CompensationState {
    Idle,
    Attempting,
    Compensating,
}

/// Per-worker compensation state machine: `Idle → Attempting →
/// Compensating` on begin, back to `Idle` on end or on any begin failure.
pub struct CarrierThread {
    pool: Arc<dyn CompensationPool>,

    state: Cell<CompensationState>,

    // Meaningful only while `state == Compensating`.
    token: Cell<Option<CompensationToken>>,

    // The current task must not migrate off this carrier while the pool
    // negotiation is in flight. Published for the hosting scheduler.
    pinned: Cell<bool>,
}

impl CarrierThread {
    pub fn new(pool: Arc<dyn CompensationPool>) -> Self {
        Self {
            pool,
            state: Cell::new(CompensationState::Idle),
            token: Cell::new(None),
            pinned: Cell::new(false),
        }
    }

    /// Called when the current task is about to block.
    ///
    /// Returns `Ok(true)` if a compensating worker was reserved, `Ok(false)`
    /// if the carrier is already compensating (compensation is never
    /// attempted twice). On pool failure the state is reset to `Idle`
    /// *before* the error propagates, so a later
    /// [`end_blocking`](Self::end_blocking) observes nothing to release.
    pub fn begin_blocking(&self) -> Result<bool, CompensationError> {
        if self.state.get() == CompensationState::Compensating {
            return Ok(false);
        }
        debug_assert_eq!(self.state.get(), CompensationState::Idle);

        self.pinned.set(true);
        self.state.set(CompensationState::Attempting);

        // Reset on every failure path, including a panicking pool.
        let mut reset = ScopeGuard::new(|| {
            self.state.set(CompensationState::Idle);
            self.pinned.set(false);
        });

        let token = self.pool.try_reserve()?;
        reset.disarm();

        self.token.set(Some(token));
        self.state.set(CompensationState::Compensating);
        self.pinned.set(false);

        tracing::trace!(token = token.as_u64(), "compensating for blocking carrier");
        Ok(true)
    }

    /// Called when the blocking call has returned. Releases the backing
    /// pool reservation iff the paired begin attempted compensation;
    /// otherwise a no-op.
    pub fn end_blocking(&self) {
        if self.state.get() != CompensationState::Compensating {
            return;
        }

        let token = self.token.take();
        debug_assert!(token.is_some(), "compensating carrier without a token");
        if let Some(token) = token {
            tracing::trace!(token = token.as_u64(), "releasing compensating worker");
            self.pool.release(token);
        }
        self.state.set(CompensationState::Idle);
    }

    pub fn is_compensating(&self) -> bool {
        self.state.get() == CompensationState::Compensating
    }

    /// Whether the current task must stay on this carrier for now. Published
    /// for the hosting scheduler to consult.
    pub fn is_pinned(&self) -> bool {
        self.pinned.get()
    }
}

thread_local! {
    static CARRIER: RefCell<Option<CarrierThread>> = const { RefCell::new(None) };
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
}

/// Installs a carrier for the current thread, for the lifetime of the
/// returned guard. One carrier per thread; installing a second is a
/// programming error in the hosting executor.
pub fn install(pool: Arc<dyn CompensationPool>) -> CarrierGuard {
    CARRIER.with(|carrier| {
        let mut carrier = carrier.borrow_mut();
        if carrier.is_some() {
            already_installed();
        }
        *carrier = Some(CarrierThread::new(pool));
    });
    CarrierGuard(())
}

#[cold]
fn already_installed() -> ! {
    panic!("a carrier is already installed on this thread")
}

pub struct CarrierGuard(());

impl Drop for CarrierGuard {
    fn drop(&mut self) {
        CARRIER.with(|carrier| {
            let previous = carrier.borrow_mut().take();
            debug_assert!(previous.is_none_or(|c| !c.is_compensating()));
        });
    }
}

pub(crate) fn with_current<R>(f: impl FnOnce(&CarrierThread) -> R) -> Option<R> {
    CARRIER.with(|carrier| carrier.borrow().as_ref().map(f))
}

/// Marks the current thread as executing a lightweight task, for the
/// lifetime of the returned guard. Entered by the hosting scheduler around
/// each task slice; compensation only applies inside such a slice.
pub fn enter_task() -> TaskGuard {
    let previous = IN_TASK.with(|flag| flag.replace(true));
    TaskGuard { previous }
}

pub struct TaskGuard {
    previous: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        IN_TASK.with(|flag| flag.set(self.previous));
    }
}

pub(crate) fn in_lightweight_task() -> bool {
    IN_TASK.with(|flag| flag.get())
}
