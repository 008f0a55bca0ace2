//! Per-thread scope stack.
//!
//! Every thread carries a stack of scope frames: one `Container` frame per
//! flock it has opened and not yet closed, and one `Bindings` frame per
//! ambient-bindings scope entered through [`crate::scoped::run`]. Only the
//! owning thread ever touches its own stack, so the storage is a plain
//! thread-local `RefCell`; cross-thread questions ("which container is
//! thread X in") go through the registry instead.

use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::flock::id::NodeId;
use crate::flock::node::FlockNode;
use crate::registry;

/// Identity of a bindings frame, so an unwinding scope can find and remove
/// its own frame even if a misordered close disturbed the stack above it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FrameId(u64);

impl FrameId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        FrameId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub(crate) enum ScopeFrame {
    Container(Arc<FlockNode>),
    Bindings(FrameId),
}

thread_local! {
    static SCOPE: RefCell<Vec<ScopeFrame>> = const { RefCell::new(Vec::new()) };
}

/// The caller's current container: the innermost flock it has opened, or
/// else the flock it was started under as a member.
pub(crate) fn current_container() -> Option<Arc<FlockNode>> {
    let own = SCOPE.with(|scope| {
        scope.borrow().iter().rev().find_map(|frame| match frame {
            ScopeFrame::Container(node) => Some(Arc::clone(node)),
            ScopeFrame::Bindings(_) => None,
        })
    });
    own.or_else(|| registry::container_of(std::thread::current().id()))
}

pub(crate) fn push_container(node: Arc<FlockNode>) {
    SCOPE.with(|scope| scope.borrow_mut().push(ScopeFrame::Container(node)));
}

/// Removes the container frame for `id`, wherever it sits in the stack. A
/// clean close finds it on top; a rescued close may find bindings frames
/// still above it.
pub(crate) fn remove_container(id: NodeId) {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        let index = scope.iter().rposition(
            |frame| matches!(frame, ScopeFrame::Container(node) if node.id() == id),
        );
        debug_assert!(index.is_some(), "container frame not found on own stack");
        if let Some(index) = index {
            scope.remove(index);
        }
    });
}

pub(crate) fn push_bindings_frame() -> FrameId {
    let id = FrameId::next();
    SCOPE.with(|scope| scope.borrow_mut().push(ScopeFrame::Bindings(id)));
    id
}

pub(crate) fn pop_bindings_frame(id: FrameId) {
    SCOPE.with(|scope| {
        let mut scope = scope.borrow_mut();
        let index = scope
            .iter()
            .rposition(|frame| matches!(frame, ScopeFrame::Bindings(frame_id) if *frame_id == id));
        debug_assert!(index.is_some(), "bindings frame not found on own stack");
        if let Some(index) = index {
            scope.remove(index);
        }
    });
}

/// What a close of `id` finds above its own frame: the nested container
/// nodes in most-recent-first order, and whether any bindings frames were
/// established after the flock opened. `None` if `id` has no frame on this
/// thread's stack.
pub(crate) fn frames_above(id: NodeId) -> Option<(SmallVec<[Arc<FlockNode>; 4]>, bool)> {
    SCOPE.with(|scope| {
        let scope = scope.borrow();
        let index = scope.iter().rposition(
            |frame| matches!(frame, ScopeFrame::Container(node) if node.id() == id),
        )?;

        let mut nested = SmallVec::new();
        let mut saw_bindings = false;
        // Most-recent-first, so rescue closes the deepest nesting level first.
        for frame in scope[index + 1..].iter().rev() {
            match frame {
                ScopeFrame::Container(node) => nested.push(Arc::clone(node)),
                ScopeFrame::Bindings(_) => saw_bindings = true,
            }
        }
        Some((nested, saw_bindings))
    })
}

#[cfg(test)]
pub(crate) fn stack_depth() -> usize {
    SCOPE.with(|scope| scope.borrow().len())
}
