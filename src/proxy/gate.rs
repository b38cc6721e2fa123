//! Admission control for in-flight requests.
//!
//! # Responsibilities
//! - Track the number of requests currently inside the lifecycle engine
//! - Reject new requests once the ceiling is reached; never queue
//! - Release each slot exactly once, however the request ends

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide in-flight counter with a hard ceiling.
#[derive(Debug)]
pub struct ConcurrencyGate {
    in_flight: AtomicUsize,
    limit: usize,
}

impl ConcurrencyGate {
    /// Create a gate with the given ceiling.
    pub fn new(limit: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            limit,
        }
    }

    /// Admit one request, or reject it if the ceiling is reached.
    ///
    /// The counter is incremented first and rolled back on rejection, so a
    /// rejected request leaves it unchanged. The returned guard performs the
    /// single decrement when dropped.
    pub fn try_admit(self: &Arc<Self>) -> Option<InFlightGuard> {
        let admitted = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if admitted > self.limit {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(InFlightGuard {
            gate: Arc::clone(self),
        })
    }

    /// Current number of admitted requests.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Configured ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// RAII slot inside the gate.
///
/// Dropping the guard releases the slot; holding it across the whole
/// response body keeps the counter honest even if the handler panics.
#[derive(Debug)]
pub struct InFlightGuard {
    gate: Arc<ConcurrencyGate>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
