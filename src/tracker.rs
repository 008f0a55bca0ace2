//! Tracks threads that are executing inside some region of code.
//!
//! The tracker answers "is thread X currently inside region R" without any
//! lock on the entry/exit path, and doubles as a reentrancy detector: a
//! second `try_begin` from the same thread fails, telling the caller to skip
//! its re-entry logic. Entries are keyed by [`std::thread::ThreadId`], a
//! stable numeric identity that user code cannot override the way it could
//! an object's hash or equality.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
pub struct MembershipTracker {
    entries: DashMap<ThreadId, ()>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the current thread if it is not already registered.
    ///
    /// `None` means the thread is already inside the region; the caller must
    /// treat the call as reentrancy and skip its re-entry logic.
    pub fn try_begin(&self) -> Option<Registration<'_>> {
        let id = thread::current().id();
        match self.entries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Registration { tracker: self, id })
            }
        }
    }

    /// Registers the current thread, asserting it is not already registered.
    ///
    /// A duplicate registration is a programming error in the caller, not a
    /// recoverable condition.
    pub fn begin(&self) -> Registration<'_> {
        match self.try_begin() {
            Some(registration) => registration,
            None => Self::duplicate_registration(),
        }
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn contains_current(&self) -> bool {
        self.contains(thread::current().id())
    }

    #[cold]
    fn duplicate_registration() -> ! {
        panic!("thread is already registered with this tracker")
    }
}

/// Proof of registration, removed on [`end`](Registration::end) or on drop,
/// so an unwinding thread cannot leak its entry.
#[derive(Debug)]
pub struct Registration<'a> {
    tracker: &'a MembershipTracker,
    id: ThreadId,
}

impl Registration<'_> {
    /// Ends the registration. Equivalent to dropping, named for call sites
    /// where the end of the region deserves to be visible.
    pub fn end(self) {}
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.id,
            thread::current().id(),
            "registration ended on a different thread than it began on"
        );
        let removed = self.tracker.entries.remove(&self.id);
        debug_assert!(removed.is_some(), "registration already removed");
    }
}
