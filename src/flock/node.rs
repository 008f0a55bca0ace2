use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{Thread, ThreadId};

use crate::flock::FlockCore;
use crate::flock::id::NodeId;

// Each open flock is backed by one node in a process-wide nesting tree. A
// node's parent is the container that enclosed the owner at open time: the
// owner's innermost open flock, or the flock the owner was itself started
// under. Parent links are set at construction and never mutated, which is
// what makes cross-thread upward walks safe without a lock.
pub(crate) struct FlockNode {
    id: NodeId,

    name: Option<String>,

    // The thread that opened the flock. The handle is what member-exit and
    // wakeup paths unpark; the id is what owner-only checks compare against.
    owner: Thread,

    // Weak so that a tree of nodes can never keep a closed flock's subtree
    // alive; the registry holds the strong reference until deregistration.
    parent: Option<Weak<FlockNode>>,

    // Back-reference to the flock state, needed when an out-of-order close
    // has to force-close this node's flock. Weak for the same cycle reason
    // as `parent`: the core owns the node, not the other way around.
    flock: Weak<FlockCore>,
}

impl FlockNode {
    pub(crate) fn new(
        name: Option<String>,
        owner: Thread,
        parent: Option<Weak<FlockNode>>,
        flock: Weak<FlockCore>,
    ) -> Self {
        Self {
            id: NodeId::next(),
            name,
            owner,
            parent,
            flock,
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn owner(&self) -> &Thread {
        &self.owner
    }

    pub(crate) fn owner_id(&self) -> ThreadId {
        self.owner.id()
    }

    pub(crate) fn parent(&self) -> Option<Arc<FlockNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn flock(&self) -> Option<Arc<FlockCore>> {
        self.flock.upgrade()
    }

    /// Whether `ancestor` appears on the parent chain starting at (and
    /// including) this node.
    pub(crate) fn is_inside(self: &Arc<Self>, ancestor: NodeId) -> bool {
        let mut current = Some(Arc::clone(self));
        while let Some(node) = current {
            if node.id == ancestor {
                return true;
            }
            current = node.parent();
        }
        false
    }
}

// Skip the parent chain to avoid printing whole trees.
impl fmt::Debug for FlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner.id())
            .finish()
    }
}
