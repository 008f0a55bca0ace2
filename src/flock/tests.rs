use super::*;
use crate::interrupt;
use crate::scoped;
use crate::test_utils::init_tracing;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::mpsc;
use std::time::{Duration, Instant};

assert_impl_all!(Flock: Send, Sync, Clone);
assert_impl_all!(FlockError: Send, Sync);

/// Holds member threads in place until the test is ready to let them go.
#[derive(Clone, Default)]
struct Gate(Arc<GateInner>);

#[derive(Default)]
struct GateInner {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self::default()
    }

    fn wait(&self) {
        let mut open = self.0.open.lock();
        while !*open {
            self.0.cv.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.0.open.lock() = true;
        self.0.cv.notify_all();
    }
}

#[rstest]
#[case::one(1)]
#[case::three(3)]
#[case::five(5)]
fn test_member_count_converges(#[case] n: usize) -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("converge"));
    let gate = Gate::new();

    for _ in 0..n {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }
    assert_eq!(flock.member_count(), n);

    gate.open();
    flock.close()?;
    assert_eq!(flock.member_count(), 0);
    assert!(flock.is_closed());
    assert!(flock.is_shutdown());
    Ok(())
}

#[test]
fn test_await_all_three_sleepers() -> Result<()> {
    // Three members sleeping 50ms: an untimed await_all returns true
    // shortly after they finish.
    init_tracing();
    let flock = Flock::open(Some("g"));
    for _ in 0..3 {
        flock.start(|| thread::sleep(Duration::from_millis(50)))?;
    }

    let started = Instant::now();
    assert!(flock.await_all()?);
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(flock.member_count(), 0);

    flock.close()?;
    Ok(())
}

#[test]
fn test_wakeup_returns_false_with_members_remaining() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("wake"));
    let stop = Arc::new(AtomicBool::new(false));

    {
        let flock = flock.clone();
        let stop = Arc::clone(&stop);
        // Signal repeatedly until told to stop: however many times the
        // permit fires, and whenever the owner happens to park, one wait
        // returns early.
        flock.clone().start(move || {
            while !stop.load(Ordering::Acquire) {
                flock.wakeup();
                thread::sleep(Duration::from_millis(5));
            }
        })?;
    }

    let started = Instant::now();
    assert!(!flock.await_all()?);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(flock.member_count(), 1);

    stop.store(true, Ordering::Release);
    // Close ignores any further permits and waits for the member itself.
    flock.close()?;
    assert_eq!(flock.member_count(), 0);
    Ok(())
}

#[test]
fn test_start_after_shutdown_fails_and_rolls_back() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("shut"));
    let gate = Gate::new();

    {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }
    assert_eq!(flock.member_count(), 1);

    flock.shutdown()?;
    assert!(flock.is_shutdown());

    let err = flock.start(|| {}).unwrap_err();
    assert!(matches!(err, FlockError::Shutdown));
    assert!(err.is_usage_error());
    // The failed registration left no trace.
    assert_eq!(flock.member_count(), 1);

    // Members already started are unaffected and the flock closes normally.
    gate.open();
    flock.close()?;
    assert_eq!(flock.member_count(), 0);
    Ok(())
}

#[test]
fn test_start_after_close_fails() -> Result<()> {
    let flock = Flock::open(Some("closed"));
    flock.close()?;

    let err = flock.start(|| {}).unwrap_err();
    assert!(matches!(err, FlockError::Closed));
    Ok(())
}

#[test]
fn test_close_is_idempotent() -> Result<()> {
    let flock = Flock::open(Some("twice"));
    flock.close()?;
    flock.close()?;
    Ok(())
}

#[test]
fn test_out_of_order_close_rescues_nested() -> Result<()> {
    init_tracing();
    let depth = crate::context::stack_depth();

    let outer = Flock::open(Some("outer"));
    let mid = Flock::open(Some("mid"));
    let inner = Flock::open(Some("inner"));

    let err = outer.close().unwrap_err();
    assert!(matches!(err, FlockError::StructureViolation));

    // Everything is closed, most recent first, despite the misordering.
    assert!(inner.is_closed());
    assert!(mid.is_closed());
    assert!(outer.is_closed());
    assert_eq!(crate::context::stack_depth(), depth);

    // Closing the rescued flocks again is a quiet no-op.
    mid.close()?;
    inner.close()?;
    Ok(())
}

#[test]
fn test_close_across_bindings_scope_reports_violation() -> Result<()> {
    init_tracing();
    let depth = crate::context::stack_depth();
    let flock = Flock::open(Some("crossed"));

    let bindings = Bindings::empty().with_value("stage", "test".to_string());
    let result = scoped::run(&bindings, || flock.close());

    assert!(matches!(result, Err(FlockError::StructureViolation)));
    assert!(flock.is_closed());
    assert_eq!(crate::context::stack_depth(), depth);
    Ok(())
}

#[test]
fn test_timed_wait_times_out_and_flock_stays_usable() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("g"));
    let gate = Gate::new();

    {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }

    // One parked member: a 100ms timed wait times out with the member
    // still counted.
    let started = Instant::now();
    let err = flock.await_all_timeout(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, FlockError::Timeout));
    assert!(err.is_wait_outcome());
    assert!(started.elapsed() >= Duration::from_millis(95));
    assert_eq!(flock.member_count(), 1);

    // The flock is fully usable for a subsequent wait.
    gate.open();
    assert!(flock.await_all()?);
    flock.close()?;
    Ok(())
}

#[test]
fn test_zero_timeout_times_out_immediately() -> Result<()> {
    let flock = Flock::open(Some("zero"));
    let gate = Gate::new();
    {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }

    let err = flock.await_all_timeout(Duration::ZERO).unwrap_err();
    assert!(matches!(err, FlockError::Timeout));

    gate.open();
    flock.close()?;
    Ok(())
}

#[test]
fn test_await_all_on_empty_flock_returns_true() -> Result<()> {
    let flock = Flock::open(Some("empty"));
    assert!(flock.await_all()?);
    assert!(flock.await_all_timeout(Duration::from_millis(10))?);
    flock.close()?;
    Ok(())
}

#[test]
fn test_owner_only_operations_rejected_from_other_threads() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("owner"));

    let outsider = {
        let flock = flock.clone();
        thread::spawn(move || {
            let await_err = flock.await_all().unwrap_err();
            let close_err = flock.close().unwrap_err();
            let shutdown_err = flock.shutdown().unwrap_err();
            let start_err = flock.start(|| {}).unwrap_err();
            (await_err, close_err, shutdown_err, start_err)
        })
    };

    let (await_err, close_err, shutdown_err, start_err) =
        outsider.join().expect("outsider panicked");
    assert!(matches!(await_err, FlockError::NotOwner));
    assert!(matches!(close_err, FlockError::NotOwner));
    assert!(matches!(shutdown_err, FlockError::NotOwner));
    assert!(matches!(start_err, FlockError::NotOwnerOrMember));

    assert!(!flock.is_closed());
    flock.close()?;
    Ok(())
}

#[test]
fn test_member_can_start_sibling() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("sibling"));
    let gate = Gate::new();
    let (tx, rx) = mpsc::channel();

    {
        let flock = flock.clone();
        let gate = gate.clone();
        flock.clone().start(move || {
            let sibling = {
                let gate = gate.clone();
                flock.start(move || gate.wait())
            };
            tx.send(sibling.is_ok()).unwrap();
            gate.wait();
        })?;
    }

    assert!(rx.recv()?, "member failed to start a sibling");
    assert_eq!(flock.member_count(), 2);

    gate.open();
    flock.close()?;
    assert_eq!(flock.member_count(), 0);
    Ok(())
}

#[test]
fn test_contains_thread_direct_and_transitive() -> Result<()> {
    init_tracing();
    let outer = Flock::open(Some("outer"));
    let gate = Gate::new();
    let (tx, rx) = mpsc::channel();

    let member = {
        let gate = gate.clone();
        outer.start(move || {
            // A flock opened by a member nests under the member's own
            // container, so its members are transitively contained.
            let inner = Flock::open(Some("inner"));
            {
                let gate = gate.clone();
                let tx = tx.clone();
                // The grandchild reports its own handle once running, so
                // the containment checks below cannot observe it half
                // registered.
                inner
                    .start(move || {
                        tx.send(thread::current()).unwrap();
                        gate.wait();
                    })
                    .expect("start grandchild");
            }
            inner.close().expect("close inner");
        })?
    };

    let grandchild = rx.recv()?;
    assert!(outer.contains_thread(&member));
    assert!(outer.contains_thread(&grandchild));
    assert!(!outer.contains_thread(&thread::current()));

    gate.open();
    outer.close()?;
    assert!(!outer.contains_thread(&member));
    assert!(!outer.contains_thread(&grandchild));
    Ok(())
}

#[test]
fn test_threads_snapshot_and_names() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("named"));
    let gate = Gate::new();

    for _ in 0..3 {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }

    let threads: Vec<Thread> = flock.threads().collect();
    assert_eq!(threads.len(), 3);
    for t in &threads {
        let name = t.name().expect("member threads are named");
        assert!(name.starts_with("gaggle-named-"), "unexpected name {name}");
    }

    gate.open();
    flock.close()?;
    assert_eq!(flock.threads().count(), 0);
    Ok(())
}

#[test]
fn test_bindings_propagate_to_members() -> Result<()> {
    init_tracing();
    let bindings = Bindings::empty().with_value("tenant", "acme".to_string());
    let (tx, rx) = mpsc::channel();

    scoped::run(&bindings, || -> Result<()> {
        let flock = Flock::open(Some("ambient"));
        flock.start(move || {
            let seen = scoped::capture()
                .get::<String>("tenant")
                .map(|v| v.as_str().to_string());
            tx.send(seen).unwrap();
        })?;
        flock.close()?;
        Ok(())
    })?;

    assert_eq!(rx.recv()?.as_deref(), Some("acme"));
    Ok(())
}

#[test]
fn test_member_panic_still_deregisters() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("panicky"));
    flock.start(|| panic!("member exploded"))?;

    // A panicking member still counts down and unparks the owner.
    assert!(flock.await_all()?);
    flock.close()?;
    Ok(())
}

#[test]
fn test_await_all_interrupted() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("intr"));
    let gate = Gate::new();
    {
        let gate = gate.clone();
        flock.start(move || gate.wait())?;
    }

    let owner = thread::current();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        interrupt::interrupt(&owner);
    });

    let err = flock.await_all().unwrap_err();
    assert!(matches!(err, FlockError::Interrupted));
    assert!(err.is_wait_outcome());
    // Bookkeeping is unaffected: the member is still counted and a retry
    // works.
    assert_eq!(flock.member_count(), 1);

    interrupter.join().expect("interrupter panicked");
    gate.open();
    assert!(flock.await_all()?);
    flock.close()?;
    Ok(())
}

#[test]
fn test_close_survives_interrupt_and_reasserts() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("persist"));
    flock.start(|| thread::sleep(Duration::from_millis(120)))?;

    let owner = thread::current();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        interrupt::interrupt(&owner);
    });

    let started = Instant::now();
    flock.close()?;
    // Close never returns early: the member's full sleep elapsed.
    assert!(started.elapsed() >= Duration::from_millis(80));
    // The swallowed interrupt was re-asserted on return.
    assert!(interrupt::take_current());

    interrupter.join().expect("interrupter panicked");
    Ok(())
}

#[test]
fn test_close_ignores_wakeup_permit() -> Result<()> {
    init_tracing();
    let flock = Flock::open(Some("stubborn"));
    {
        let flock = flock.clone();
        flock.clone().start(move || {
            thread::sleep(Duration::from_millis(20));
            flock.wakeup();
            thread::sleep(Duration::from_millis(80));
        })?;
    }

    let started = Instant::now();
    flock.close()?;
    // The wakeup permit did not shortcut the close: the member's second
    // sleep elapsed in full.
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(flock.member_count(), 0);
    Ok(())
}

#[test]
fn test_nested_open_parents_on_innermost() -> Result<()> {
    init_tracing();
    let outer = Flock::open(Some("outer"));
    let inner = Flock::open(Some("inner"));

    // The inner node sits under the outer node in the nesting tree.
    assert!(inner.core.node.is_inside(outer.core.node.id()));
    assert!(!outer.core.node.is_inside(inner.core.node.id()));

    inner.close()?;
    outer.close()?;
    Ok(())
}

#[test]
fn test_close_deregisters_node() -> Result<()> {
    let flock = Flock::open(Some("registered"));
    let id = flock.core.node.id();
    assert!(crate::registry::is_registered(id));

    flock.close()?;
    assert!(!crate::registry::is_registered(id));
    Ok(())
}
