use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a node in the flock tree. Unique for the lifetime of the
/// process; never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub(crate) struct NodeId(NonZeroU64);

impl NodeId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety margin: even at a billion opens per second this takes
        // centuries to wrap.
        let Some(id) = NonZeroU64::new(id) else {
            exhausted("node");
        };

        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical identity of a member thread, assigned at registration time on
/// the starting thread, before the OS thread exists. Membership bookkeeping
/// keys on this value rather than on anything derived from the thread
/// object itself.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub(crate) struct MemberId(NonZeroU64);

impl MemberId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let Some(id) = NonZeroU64::new(id) else {
            exhausted("member");
        };

        MemberId(id)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cold]
fn exhausted(kind: &str) -> ! {
    panic!("failed to generate unique {kind} id: bitspace exhausted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_ids_unique() {
        let ids: HashSet<NodeId> = (0..100).map(|_| NodeId::next()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_member_ids_unique() {
        let ids: HashSet<MemberId> = (0..100).map(|_| MemberId::next()).collect();
        assert_eq!(ids.len(), 100);
    }
}
