//! Owned, named groups of member threads with a shared lifecycle.
//!
//! A [`Flock`] is opened by one thread, the owner, and tracks the set of
//! member threads started through it. Membership bookkeeping is lock-free:
//! an atomic count is authoritative for the owner's wake decisions, and a
//! concurrent map keyed by logical member id is authoritative for
//! containment queries. The owner parks in [`await_all`](Flock::await_all)
//! or [`close`](Flock::close) until the count returns to zero, with
//! [`wakeup`](Flock::wakeup) as a cooperative early-out for `await_all`.
//!
//! Flocks opened on one thread nest: closing them out of order is rescued
//! (the nested flocks are closed first) and then reported as a structure
//! violation, so resources never leak even when the discipline is broken.

mod errors;
pub use errors::FlockError;

pub(crate) mod id;
pub(crate) mod node;

#[cfg(test)]
mod tests;

use dashmap::DashMap;
use smallvec::SmallVec;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::context;
use crate::flock::id::MemberId;
use crate::flock::node::FlockNode;
use crate::interrupt;
use crate::registry;
use crate::scoped::{self, Bindings};
use crate::utils::ScopeGuard;

/// An owned group of member threads. Cloning the handle is cheap and shares
/// the same flock; lifecycle-control operations stay restricted to the
/// owner thread no matter which handle they are called through.
#[derive(Clone)]
pub struct Flock {
    core: Arc<FlockCore>,
}

impl Flock {
    /// Opens a new flock owned by the current thread.
    ///
    /// The flock captures the caller's ambient bindings for propagation to
    /// members, and nests under the caller's current container: the
    /// innermost flock the caller has open, or else the flock the caller
    /// was itself started under.
    pub fn open(name: Option<&str>) -> Flock {
        let parent = context::current_container();
        let owner = thread::current();

        let core = Arc::new_cyclic(|weak: &Weak<FlockCore>| {
            let node = Arc::new(FlockNode::new(
                name.map(str::to_string),
                owner.clone(),
                parent.as_ref().map(Arc::downgrade),
                Weak::clone(weak),
            ));
            let registry_key = registry::register(Arc::clone(&node));

            FlockCore {
                node,
                registry_key,
                bindings: scoped::capture(),
                members: DashMap::new(),
                member_count: AtomicUsize::new(0),
                member_seq: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wakeup: AtomicBool::new(false),
            }
        });

        context::push_container(Arc::clone(&core.node));
        tracing::debug!(
            id = %core.node.id(),
            name = core.node.name().unwrap_or(""),
            "flock opened"
        );

        Flock { core }
    }

    pub fn name(&self) -> Option<&str> {
        self.core.node.name()
    }

    /// The thread that opened the flock.
    pub fn owner(&self) -> &Thread {
        self.core.node.owner()
    }

    /// Starts a new member thread running `f`.
    ///
    /// Callable by the owner or by any current member. Fails if the flock
    /// is shut down or closed; a `shutdown` that races with registration
    /// wins, and the registration is rolled back as if it never happened.
    pub fn start<F>(&self, f: F) -> Result<Thread, FlockError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.start(f)
    }

    /// Prevents further `start` calls. Owner-only, idempotent, never
    /// blocks; members already running are unaffected.
    pub fn shutdown(&self) -> Result<(), FlockError> {
        self.core.shutdown()
    }

    /// Parks the owner until membership is empty or a wakeup arrives.
    ///
    /// Returns `Ok(true)` iff membership is empty at return. Owner-only.
    pub fn await_all(&self) -> Result<bool, FlockError> {
        self.core.await_members(None)
    }

    /// As [`await_all`](Flock::await_all), with a deadline computed once up
    /// front. Elapsing without emptiness or wakeup fails with
    /// [`FlockError::Timeout`], which leaves the flock fully usable.
    pub fn await_all_timeout(&self, timeout: Duration) -> Result<bool, FlockError> {
        // A timeout too large to represent waits unbounded.
        self.core.await_members(Instant::now().checked_add(timeout))
    }

    /// Signals the owner to return early from `await_all`. Callable from
    /// any thread; idempotent while a permit is already pending.
    pub fn wakeup(&self) {
        self.core.wakeup();
    }

    /// Shuts the flock down, waits for all members to finish, and detaches
    /// it from the owner's scope. Owner-only; idempotent after the first
    /// completed call.
    ///
    /// Unlike `await_all`, close ignores wakeup permits and swallows
    /// interrupts (re-asserting the interrupt status on return): it never
    /// returns before membership is empty. If more recently opened flocks
    /// are still open, they are force-closed first, most recent first, and
    /// the misordering is then reported as
    /// [`FlockError::StructureViolation`].
    pub fn close(&self) -> Result<(), FlockError> {
        self.core.close()
    }

    pub fn is_shutdown(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// The number of live members. Authoritative for wake decisions; a
    /// concurrent `start` or member exit can move it at any time.
    pub fn member_count(&self) -> usize {
        self.core.member_count.load(Ordering::Acquire)
    }

    /// Whether `thread` is a direct member, or a member of some flock owned
    /// transitively by a member of this flock.
    pub fn contains_thread(&self, thread: &Thread) -> bool {
        match registry::container_of(thread.id()) {
            Some(node) => node.is_inside(self.core.node.id()),
            None => false,
        }
    }

    /// A weakly-consistent snapshot of the live member threads.
    pub fn threads(&self) -> impl Iterator<Item = Thread> {
        let snapshot: SmallVec<[Thread; 8]> = self
            .core
            .members
            .iter()
            .filter_map(|entry| entry.value().clone())
            .collect();
        snapshot.into_iter()
    }
}

impl fmt::Debug for Flock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flock")
            .field("node", &self.core.node)
            .field("members", &self.core.member_count.load(Ordering::Acquire))
            .field("shutdown", &self.core.shutdown)
            .field("closed", &self.core.closed)
            .finish()
    }
}

pub(crate) struct FlockCore {
    node: Arc<FlockNode>,
    registry_key: registry::RegistryKey,

    // Snapshot of the opener's ambient bindings, installed in every member.
    bindings: Bindings,

    // The map answers containment, the count answers "can the owner wake".
    // They agree modulo the transient window inside add/remove.
    members: DashMap<MemberId, Option<Thread>>,
    member_count: AtomicUsize,

    // Monotonic suffix for member thread names.
    member_seq: AtomicUsize,

    shutdown: AtomicBool,
    closed: AtomicBool,

    // The wakeup permit. Sticky until consumed by an `await_members` entry
    // or permit check.
    wakeup: AtomicBool,
}

impl FlockCore {
    fn start<F>(self: &Arc<Self>, f: F) -> Result<Thread, FlockError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_owner_or_member()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(FlockError::Closed);
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FlockError::Shutdown);
        }

        let member = MemberId::next();
        self.members.insert(member, None);
        self.member_count.fetch_add(1, Ordering::AcqRel);

        // Registration is transactional: a shutdown that raced in after the
        // pre-check wins, and a failed spawn leaves no trace either.
        let mut rollback = ScopeGuard::new(|| self.remove_member(member));
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FlockError::Shutdown);
        }

        let seq = self.member_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("gaggle-{}-{}", self.node.name().unwrap_or("flock"), seq);
        let core = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || member_main(core, member, f))?;
        rollback.disarm();

        let thread = handle.thread().clone();
        if let Some(mut slot) = self.members.get_mut(&member) {
            *slot = Some(thread.clone());
        }

        tracing::trace!(id = %self.node.id(), member = %member, "member started");
        Ok(thread)
    }

    fn shutdown(&self) -> Result<(), FlockError> {
        self.ensure_owner()?;
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!(id = %self.node.id(), "flock shut down");
        }
        Ok(())
    }

    fn await_members(&self, deadline: Option<Instant>) -> Result<bool, FlockError> {
        self.ensure_owner()?;

        // A permit left over from a previous wait must not satisfy this one.
        self.wakeup.store(false, Ordering::Release);

        loop {
            if self.member_count.load(Ordering::Acquire) == 0 {
                return Ok(true);
            }
            if self.wakeup.swap(false, Ordering::AcqRel) {
                return Ok(self.member_count.load(Ordering::Acquire) == 0);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FlockError::Timeout);
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }

            if interrupt::take_current() {
                return Err(FlockError::Interrupted);
            }
        }
    }

    fn wakeup(&self) {
        // Permit before unpark, so a racing spontaneous wake cannot lose
        // the signal. While a permit is already pending there is nothing to
        // do: the owner has not consumed the previous one yet.
        if !self.wakeup.swap(true, Ordering::AcqRel)
            && thread::current().id() != self.node.owner_id()
        {
            self.node.owner().unpark();
        }
    }

    pub(crate) fn close(&self) -> Result<(), FlockError> {
        self.ensure_owner()?;
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let violation = self.rescue_out_of_order();

        self.shutdown.store(true, Ordering::Release);

        // Close always waits for true emptiness: wakeup permits are
        // ignored, interrupts are remembered rather than acted on.
        let mut interrupted = false;
        while self.member_count.load(Ordering::Acquire) != 0 {
            thread::park();
            if interrupt::take_current() {
                interrupted = true;
            }
        }

        self.closed.store(true, Ordering::Release);
        context::remove_container(self.node.id());
        registry::deregister(self.registry_key);
        tracing::debug!(id = %self.node.id(), "flock closed");

        if interrupted {
            interrupt::set_current();
        }

        if violation {
            Err(FlockError::StructureViolation)
        } else {
            Ok(())
        }
    }

    /// Handles flocks and bindings scopes opened after this flock and still
    /// open at close time. Nested flocks are force-closed most recent
    /// first; each nested close pops its own frame and rescues its own
    /// nesting recursively. Returns whether anything was out of order.
    fn rescue_out_of_order(&self) -> bool {
        let Some((nested, saw_bindings)) = context::frames_above(self.node.id()) else {
            debug_assert!(false, "closing a flock with no frame on the owner stack");
            return false;
        };

        for node in &nested {
            tracing::warn!(nested = %node.id(), closing = %self.node.id(), "force-closing nested flock");
            match node.flock() {
                // The nested close may itself report a violation; it has
                // been rescued, and the report belongs to this close.
                Some(core) => {
                    let _ = core.close();
                }
                // Core already dropped; only the stale frame is left.
                None => context::remove_container(node.id()),
            }
        }

        saw_bindings || !nested.is_empty()
    }

    fn remove_member(&self, member: MemberId) {
        self.members.remove(&member);
        // The release half of this decrement pairs with the owner's acquire
        // load: reaching zero happens-before the owner observing zero.
        let previous = self.member_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "member count underflow");
        if previous == 1 {
            self.node.owner().unpark();
        }
    }

    fn ensure_owner(&self) -> Result<(), FlockError> {
        if thread::current().id() == self.node.owner_id() {
            Ok(())
        } else {
            Err(FlockError::NotOwner)
        }
    }

    fn ensure_owner_or_member(&self) -> Result<(), FlockError> {
        if thread::current().id() == self.node.owner_id() {
            return Ok(());
        }
        match context::current_container() {
            Some(node) if node.is_inside(self.node.id()) => Ok(()),
            _ => Err(FlockError::NotOwnerOrMember),
        }
    }
}

impl Drop for FlockCore {
    fn drop(&mut self) {
        // Members hold a strong reference, so by the time the core drops
        // there are none left; only the registry entry can still leak.
        if !self.closed.load(Ordering::Acquire) {
            tracing::warn!(id = %self.node.id(), "flock dropped without close");
            registry::deregister(self.registry_key);
        }
    }
}

fn member_main<F: FnOnce()>(core: Arc<FlockCore>, member: MemberId, f: F) {
    // Declared first so it runs last: the registry binding and ambient
    // bindings must be gone before the owner can observe membership
    // reaching zero.
    let _exit = ScopeGuard::new(|| {
        tracing::trace!(member = %member, "member finished");
        core.remove_member(member);
    });
    let _binding = registry::bind_current_thread(Arc::clone(&core.node));
    let _ambient = scoped::install(core.bindings.clone());

    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(member = %member, "member thread panicked");
    }
}
