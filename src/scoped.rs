//! Ambient bindings propagated from a flock's opener to its members.
//!
//! A [`Bindings`] value is an immutable snapshot of named values. Opening a
//! flock captures the opener's snapshot; every member starts with it
//! installed, so call-scoped configuration flows into worker threads without
//! being threaded through every signature. [`run`] installs a snapshot for a
//! closure's duration and marks the scope on the caller's stack, so a flock
//! close that crosses the scope boundary is reported as a structure
//! violation.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::{self, FrameId};

type Entries = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// An immutable snapshot of ambient bindings. Cheap to clone and to hand
/// across threads; deriving a new snapshot never mutates an existing one.
#[derive(Clone, Default)]
pub struct Bindings {
    entries: Arc<Entries>,
}

impl Bindings {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derives a snapshot with `key` bound to `value`.
    pub fn with_value<T: Send + Sync + 'static>(&self, key: &'static str, value: T) -> Self {
        let mut entries = Entries::clone(&self.entries);
        entries.insert(key, Arc::new(value));
        Bindings {
            entries: Arc::new(entries),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &'static str) -> Option<Arc<T>> {
        self.entries
            .get(key)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Bindings> = std::cell::RefCell::new(Bindings::empty());
}

/// The current thread's ambient snapshot.
pub fn capture() -> Bindings {
    CURRENT.with(|current| current.borrow().clone())
}

/// Runs `f` with `bindings` installed as the ambient snapshot.
///
/// The scope is pushed onto the caller's stack: closing a flock that was
/// opened before this scope, from inside it, is a nesting violation the
/// close will report.
pub fn run<R>(bindings: &Bindings, f: impl FnOnce() -> R) -> R {
    let _installed = install(bindings.clone());
    let _frame = BindingsFrame::push();
    f()
}

/// Installs `bindings` without marking a scope frame. Used on member-thread
/// entry, where the snapshot covers the thread's whole lifetime and there is
/// no enclosing frame to violate.
pub(crate) fn install(bindings: Bindings) -> InstalledBindings {
    let previous = CURRENT.with(|current| current.replace(bindings));
    InstalledBindings { previous }
}

pub(crate) struct InstalledBindings {
    previous: Bindings,
}

impl Drop for InstalledBindings {
    fn drop(&mut self) {
        let previous = std::mem::take(&mut self.previous);
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

struct BindingsFrame(FrameId);

impl BindingsFrame {
    fn push() -> Self {
        BindingsFrame(context::push_bindings_frame())
    }
}

impl Drop for BindingsFrame {
    fn drop(&mut self) {
        context::pop_bindings_frame(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Bindings: Send, Sync, Clone);

    #[test]
    fn test_empty_capture() {
        assert!(capture().is_empty());
    }

    #[test]
    fn test_with_value_derives_immutably() {
        let base = Bindings::empty();
        let derived = base.with_value("deadline-ms", 250u64);

        assert!(base.get::<u64>("deadline-ms").is_none());
        assert_eq!(*derived.get::<u64>("deadline-ms").unwrap(), 250);
        // Wrong type never aliases.
        assert!(derived.get::<String>("deadline-ms").is_none());
    }

    #[test]
    fn test_run_installs_and_restores() {
        let bindings = Bindings::empty().with_value("tenant", "acme".to_string());

        run(&bindings, || {
            let captured = capture();
            assert_eq!(captured.get::<String>("tenant").unwrap().as_str(), "acme");
        });

        assert!(capture().get::<String>("tenant").is_none());
    }

    #[test]
    fn test_run_restores_on_unwind() {
        let bindings = Bindings::empty().with_value("tenant", "acme".to_string());
        let depth = crate::context::stack_depth();

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run(&bindings, || panic!("boom"));
        }));

        assert!(res.is_err());
        assert!(capture().get::<String>("tenant").is_none());
        assert_eq!(crate::context::stack_depth(), depth);
    }

    #[test]
    fn test_nested_runs_shadow() {
        let outer = Bindings::empty().with_value("level", 1u32);
        let inner = outer.with_value("level", 2u32);

        run(&outer, || {
            assert_eq!(*capture().get::<u32>("level").unwrap(), 1);
            run(&inner, || {
                assert_eq!(*capture().get::<u32>("level").unwrap(), 2);
            });
            assert_eq!(*capture().get::<u32>("level").unwrap(), 1);
        });
    }
}
