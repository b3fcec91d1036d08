//! Admission gate for work that touches shared server state.
//!
//! Every continuation in the pipeline calls [`ShutdownGate::enter`] after an
//! I/O wait completes and before it mutates anything shared. Once
//! [`ShutdownGate::shutdown`] has run, `enter` returns `None` and the caller
//! must return without side effects.
//!
//! Tokens are held across synchronous sections only, never across an
//! `.await`, so draining always terminates promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_utils::Backoff;

/// Reference-counting gate. The counter holds the number of live tokens,
/// or `-1` once shut down.
#[derive(Debug, Default)]
pub struct ShutdownGate {
    count: AtomicIsize,
}

/// Permission to proceed, released on drop.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the token is dropped"]
pub struct GateToken {
    gate: Arc<ShutdownGate>,
}

impl Drop for GateToken {
    fn drop(&mut self) {
        self.gate.count.fetch_sub(1, Ordering::Release);
    }
}

impl ShutdownGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Takes a token, or returns `None` if shutdown has begun.
    pub fn enter(self: &Arc<Self>) -> Option<GateToken> {
        let backoff = Backoff::new();
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(GateToken {
                        gate: Arc::clone(self),
                    });
                }
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Closes the gate to new entries and waits until every outstanding
    /// token has been dropped. Idempotent.
    pub fn shutdown(&self) {
        let backoff = Backoff::new();
        loop {
            match self
                .count
                .compare_exchange_weak(0, -1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) if actual < 0 => return,
                Err(_) => backoff.snooze(),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.count.load(Ordering::Acquire) < 0
    }

    /// Tokens currently held.
    pub fn in_flight(&self) -> usize {
        usize::try_from(self.count.load(Ordering::Acquire)).unwrap_or(0)
    }
}
