//! Process-wide container registry.
//!
//! Tracks two mappings with deterministic lifetimes: every open flock's node
//! (registered at open, removed at close) and every live member thread's
//! container (bound for exactly the duration of the member's run). Both sit
//! on hot paths — member entry/exit and containment queries — so storage is
//! per-entry atomic maps, never a global lock.

use dashmap::DashMap;
use std::sync::{Arc, LazyLock};
use std::thread::{self, ThreadId};

use crate::flock::id::NodeId;
use crate::flock::node::FlockNode;

struct Registry {
    nodes: DashMap<NodeId, Arc<FlockNode>>,
    threads: DashMap<ThreadId, Arc<FlockNode>>,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| Registry {
    nodes: DashMap::new(),
    threads: DashMap::new(),
});

/// Key returned by [`register`]; closing the flock hands it back to
/// [`deregister`] so removal is explicit rather than garbage-collected.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RegistryKey(NodeId);

pub(crate) fn register(node: Arc<FlockNode>) -> RegistryKey {
    let id = node.id();
    let previous = REGISTRY.nodes.insert(id, node);
    debug_assert!(previous.is_none(), "node id registered twice");
    RegistryKey(id)
}

pub(crate) fn deregister(key: RegistryKey) {
    let removed = REGISTRY.nodes.remove(&key.0);
    debug_assert!(removed.is_some(), "node already deregistered");
}

/// The container `thread` is currently a member of, if any.
pub(crate) fn container_of(thread: ThreadId) -> Option<Arc<FlockNode>> {
    REGISTRY.threads.get(&thread).map(|e| Arc::clone(e.value()))
}

/// Binds the current thread to `node` for the lifetime of the returned
/// guard. Member wrappers hold this for the whole user-code run; the drop
/// runs before the member-exit bookkeeping commits, so a woken owner never
/// observes a stale binding.
pub(crate) fn bind_current_thread(node: Arc<FlockNode>) -> ThreadBinding {
    let id = thread::current().id();
    let previous = REGISTRY.threads.insert(id, node);
    debug_assert!(previous.is_none(), "thread already bound to a container");
    ThreadBinding(id)
}

pub(crate) struct ThreadBinding(ThreadId);

impl Drop for ThreadBinding {
    fn drop(&mut self) {
        REGISTRY.threads.remove(&self.0);
    }
}

#[cfg(test)]
pub(crate) fn is_registered(id: NodeId) -> bool {
    REGISTRY.nodes.contains_key(&id)
}
