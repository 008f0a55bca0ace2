//! Cooperative interrupt status for parked waiters.
//!
//! A waiter parked in [`Flock::await_all`](crate::Flock::await_all) or
//! [`Flock::close`](crate::Flock::close) can be interrupted from any other
//! thread. The status is a sticky per-thread flag: [`interrupt`] sets it and
//! unparks the target, the waiter consumes it with [`take_current`]. `close`
//! re-asserts a consumed flag with [`set_current`] because it is not allowed
//! to return before its members are gone.

use dashmap::DashMap;
use std::cell::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, Thread, ThreadId};

#[derive(Debug)]
struct InterruptState {
    flag: AtomicBool,
}

static STATES: LazyLock<DashMap<ThreadId, Arc<InterruptState>>> = LazyLock::new(DashMap::new);

// Removes the current thread's entry when the thread exits, so the table
// only ever holds live threads that participated.
struct Deregister(ThreadId);

impl Drop for Deregister {
    fn drop(&mut self) {
        STATES.remove(&self.0);
    }
}

thread_local! {
    static DEREGISTER: OnceCell<Deregister> = const { OnceCell::new() };
}

fn state_of(id: ThreadId) -> Arc<InterruptState> {
    Arc::clone(
        STATES
            .entry(id)
            .or_insert_with(|| {
                Arc::new(InterruptState {
                    flag: AtomicBool::new(false),
                })
            })
            .value(),
    )
}

fn current_state() -> Arc<InterruptState> {
    let id = thread::current().id();
    DEREGISTER.with(|cell| {
        cell.get_or_init(|| Deregister(id));
    });
    state_of(id)
}

/// Requests an interrupt on `target`.
///
/// The flag is set *before* the unpark, the same ordering rule as
/// `Flock::wakeup`, so a racing spontaneous wakeup cannot lose the signal.
pub fn interrupt(target: &Thread) {
    state_of(target.id()).flag.store(true, Ordering::Release);
    target.unpark();
}

/// Tests and clears the current thread's interrupt status.
pub fn take_current() -> bool {
    let id = thread::current().id();
    STATES
        .get(&id)
        .map(|s| s.flag.swap(false, Ordering::AcqRel))
        .unwrap_or(false)
}

/// Re-asserts the current thread's interrupt status.
pub fn set_current() {
    current_state().flag.store(true, Ordering::Release);
}
