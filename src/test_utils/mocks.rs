use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::carrier::{CompensationError, CompensationPool, CompensationToken};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum PoolEvent {
    Reserve(u64),
    Release(u64),
}

/// A backing pool that hands out up to `capacity` compensating workers and
/// records every reserve/release so tests can assert symmetry.
#[derive(Debug)]
pub(crate) struct MockPool {
    capacity: usize,
    outstanding: AtomicUsize,
    next_token: AtomicU64,
    events: Mutex<Vec<PoolEvent>>,
}

impl MockPool {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            outstanding: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Every released token had been reserved, and nothing reserved is
    /// still outstanding in the event log.
    pub(crate) fn releases_match_reserves(&self) -> bool {
        let events = self.events.lock();
        let mut reserved: Vec<u64> = Vec::new();

        for event in events.iter() {
            match event {
                PoolEvent::Reserve(token) => reserved.push(*token),
                PoolEvent::Release(token) => {
                    let Some(index) = reserved.iter().position(|t| t == token) else {
                        return false;
                    };
                    reserved.swap_remove(index);
                }
            }
        }
        reserved.is_empty()
    }
}

impl CompensationPool for MockPool {
    fn try_reserve(&self) -> Result<CompensationToken, CompensationError> {
        let mut outstanding = self.outstanding.load(Ordering::Acquire);
        loop {
            if outstanding >= self.capacity {
                return Err(CompensationError::Exhausted);
            }
            match self.outstanding.compare_exchange(
                outstanding,
                outstanding + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => outstanding = current,
            }
        }

        let token = CompensationToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.events.lock().push(PoolEvent::Reserve(token.as_u64()));
        Ok(token)
    }

    fn release(&self, token: CompensationToken) {
        self.events.lock().push(PoolEvent::Release(token.as_u64()));
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "release without a matching reserve");
    }
}

/// A backing pool that is permanently shutting down.
#[derive(Debug)]
pub(crate) struct FailingPool;

impl CompensationPool for FailingPool {
    fn try_reserve(&self) -> Result<CompensationToken, CompensationError> {
        Err(CompensationError::PoolShutdown)
    }

    fn release(&self, _token: CompensationToken) {
        panic!("released a token that was never reserved");
    }
}
