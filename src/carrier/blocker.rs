//! The blocking gate: per-call-site entry point for compensation.
//!
//! Blocking call sites bracket the syscall with [`begin`]/[`end`] (or hold
//! a [`BlockGuard`], which releases on every exit path including unwinds).
//! The gate decides whether compensation applies at all: only when the
//! current thread is executing a lightweight task on an installed carrier,
//! and only for the outermost blocking region on that thread. Everything
//! else gets a "not attempted" token whose `end` is a guaranteed no-op, so
//! the bracket is safe to put around any potentially blocking call.

use std::sync::LazyLock;

use crate::carrier::{self, CompensationError};
use crate::tracker::{MembershipTracker, Registration};

// One blocking region per thread: an inner begin sees the registration and
// backs off instead of compensating twice.
static BLOCKING: LazyLock<MembershipTracker> = LazyLock::new(MembershipTracker::new);

/// Proof of a `begin` call, to be handed back to [`end`].
#[derive(Debug)]
pub struct BlockToken {
    attempted: bool,
    registration: Option<Registration<'static>>,
}

impl BlockToken {
    fn not_attempted() -> Self {
        BlockToken {
            attempted: false,
            registration: None,
        }
    }

    /// Whether this begin actually reserved a compensating worker.
    pub fn attempted(&self) -> bool {
        self.attempted
    }
}

/// Marks the beginning of a possibly-blocking region.
///
/// Attempts compensation only when running a lightweight task on a
/// compensation-capable carrier, and only for the outermost region. A pool
/// failure propagates with the carrier already reset, so no token needs
/// releasing.
pub fn begin() -> Result<BlockToken, CompensationError> {
    if !carrier::in_lightweight_task() {
        return Ok(BlockToken::not_attempted());
    }
    let Some(registration) = BLOCKING.try_begin() else {
        // Already inside a blocking region on this thread.
        return Ok(BlockToken::not_attempted());
    };

    match carrier::with_current(|carrier| carrier.begin_blocking()) {
        // Plain thread without a carrier: compensation does not apply.
        None => {
            registration.end();
            Ok(BlockToken::not_attempted())
        }
        Some(Ok(attempted)) => Ok(BlockToken {
            attempted,
            registration: Some(registration),
        }),
        Some(Err(err)) => {
            registration.end();
            Err(err)
        }
    }
}

/// Marks the end of a possibly-blocking region. Releases the compensating
/// worker iff the paired [`begin`] attempted compensation; a no-op for
/// "not attempted" tokens.
pub fn end(token: BlockToken) {
    if token.attempted {
        let released = carrier::with_current(|carrier| carrier.end_blocking());
        debug_assert!(released.is_some(), "carrier uninstalled mid blocking region");
    }
    // The registration, if any, drops here and reopens the gate.
    drop(token);
}

/// RAII form of the [`begin`]/[`end`] pair.
pub struct BlockGuard {
    token: Option<BlockToken>,
}

/// Enters a blocking region that ends when the guard drops, on all exit
/// paths.
pub fn enter() -> Result<BlockGuard, CompensationError> {
    begin().map(|token| BlockGuard { token: Some(token) })
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            end(token);
        }
    }
}
