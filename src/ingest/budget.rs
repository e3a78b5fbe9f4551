// src/ingest/budget.rs
//! Rate budget for the upstream feed. The single authority for "may we
//! fetch now": windows roll over lazily on the first call past their end.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBudgetState {
    pub window_start: DateTime<Utc>,
    pub calls_used: u32,
    pub calls_allowed: u32,
    /// Normally `window_start + window_length`; moved by upstream reset hints.
    pub window_end: DateTime<Utc>,
}

pub struct RateBudget {
    clock: SharedClock,
    window: Duration,
    state: Mutex<RateBudgetState>,
}

impl RateBudget {
    pub fn new(clock: SharedClock, calls_allowed: u32, window: Duration) -> Self {
        let now = clock.now();
        Self {
            clock,
            window,
            state: Mutex::new(RateBudgetState {
                window_start: now,
                calls_used: 0,
                calls_allowed,
                window_end: now + window,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateBudgetState> {
        // The state is always written whole; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn roll(&self, st: &mut RateBudgetState) {
        let now = self.clock.now();
        if now >= st.window_end {
            st.window_start = now;
            st.window_end = now + self.window;
            st.calls_used = 0;
        }
    }

    /// Consume `n` calls if they fit in the current window. On refusal the
    /// state is left untouched.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut st = self.lock();
        self.roll(&mut st);
        let ok = st
            .calls_used
            .checked_add(n)
            .is_some_and(|used| used <= st.calls_allowed);
        if ok {
            st.calls_used += n;
        }
        gauge!("rate_budget_remaining").set(f64::from(st.calls_allowed - st.calls_used));
        ok
    }

    pub fn remaining(&self) -> u32 {
        let mut st = self.lock();
        self.roll(&mut st);
        st.calls_allowed - st.calls_used
    }

    pub fn window_reset_at(&self) -> DateTime<Utc> {
        let mut st = self.lock();
        self.roll(&mut st);
        st.window_end
    }

    /// Upstream said we are out of quota. Treat the budget as spent now and
    /// end the window at the upstream reset instant when one was given.
    pub fn exhaust(&self, upstream_reset: Option<DateTime<Utc>>) {
        let mut st = self.lock();
        self.roll(&mut st);
        st.calls_used = st.calls_allowed;
        if let Some(reset) = upstream_reset {
            st.window_end = reset.max(self.clock.now());
        }
        gauge!("rate_budget_remaining").set(0.0);
        tracing::warn!(
            target: "ingest",
            reset_at = %st.window_end,
            "rate budget exhausted by upstream"
        );
    }

    pub fn snapshot(&self) -> RateBudgetState {
        let mut st = self.lock();
        self.roll(&mut st);
        *st
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn budget(calls: u32) -> (ManualClock, RateBudget) {
        let clock = ManualClock::at_epoch();
        let b = RateBudget::new(Arc::new(clock.clone()), calls, Duration::minutes(15));
        (clock, b)
    }

    #[test]
    fn refusal_leaves_state_untouched() {
        let (_c, b) = budget(3);
        assert!(b.try_consume(2));
        assert!(!b.try_consume(2));
        assert_eq!(b.remaining(), 1);
        assert!(b.try_consume(1));
    }

    #[test]
    fn window_rolls_lazily() {
        let (clock, b) = budget(1);
        assert!(b.try_consume(1));
        assert!(!b.try_consume(1));
        clock.advance(Duration::minutes(15));
        assert_eq!(b.remaining(), 1);
        assert!(b.try_consume(1));
    }

    #[test]
    fn upstream_exhaust_moves_reset() {
        let (clock, b) = budget(10);
        let reset = clock.now() + Duration::minutes(2);
        b.exhaust(Some(reset));
        assert_eq!(b.remaining(), 0);
        assert_eq!(b.window_reset_at(), reset);
        clock.advance(Duration::minutes(2));
        assert_eq!(b.remaining(), 10);
    }
}
