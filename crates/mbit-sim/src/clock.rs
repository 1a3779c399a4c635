//! Per-device virtual clock
//!
//! Simulated time is a microsecond counter that only moves when its owner
//! advances it. Pending wake requests fire in deadline order; requests
//! sharing a deadline fire in the order they were registered.

use std::collections::{BTreeMap, HashMap};

/// Handle for a pending wake request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WakeToken(u64);

impl WakeToken {
    /// Get the raw token value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Monotonic simulated clock with an ordered wake set
#[derive(Debug, Default)]
pub struct VirtualClock {
    now_micros: u64,
    next_token: u64,
    /// Keyed by (deadline, token); tokens grow with arrival order so ties are FIFO
    pending: BTreeMap<(u64, u64), WakeToken>,
    deadlines: HashMap<WakeToken, u64>,
}

impl VirtualClock {
    /// Create a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time in microseconds
    pub fn now_micros(&self) -> u64 {
        self.now_micros
    }

    /// Move the clock forward and return every wake request that came due
    ///
    /// Fired tokens are returned in deadline order. The clock saturates
    /// instead of wrapping.
    pub fn advance(&mut self, delta_micros: u64) -> Vec<WakeToken> {
        self.now_micros = self.now_micros.saturating_add(delta_micros);
        self.fire_due()
    }

    /// Move the clock forward to `deadline` if it lies in the future
    pub fn advance_to(&mut self, deadline: u64) -> Vec<WakeToken> {
        let delta = deadline.saturating_sub(self.now_micros);
        self.advance(delta)
    }

    /// Register a wake request for an absolute deadline
    pub fn sleep_until(&mut self, deadline_micros: u64) -> WakeToken {
        let token = WakeToken(self.next_token);
        self.next_token += 1;
        self.pending.insert((deadline_micros, token.0), token);
        self.deadlines.insert(token, deadline_micros);
        token
    }

    /// Register a wake request `delta_micros` from now
    pub fn sleep_for(&mut self, delta_micros: u64) -> WakeToken {
        self.sleep_until(self.now_micros.saturating_add(delta_micros))
    }

    /// Remove a pending wake request; returns false if it already fired
    pub fn cancel(&mut self, token: WakeToken) -> bool {
        match self.deadlines.remove(&token) {
            Some(deadline) => self.pending.remove(&(deadline, token.0)).is_some(),
            None => false,
        }
    }

    /// Drop every pending wake request
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        self.deadlines.clear();
        count
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Number of pending wake requests
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn fire_due(&mut self) -> Vec<WakeToken> {
        let mut fired = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > self.now_micros {
                break;
            }
            let token = entry.remove();
            self.deadlines.remove(&token);
            fired.push(token);
        }
        fired
    }
}
