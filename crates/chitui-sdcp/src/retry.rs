// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bounded retry schedules.
//
// Nothing in the command path retries on its own. Callers that repeat
// idempotent work (file-list detection after a transfer, reconnects) walk
// an explicit schedule and stop when it is exhausted.

use std::time::Duration;

use tracing::{debug, warn};

use chitui_core::error::ChituiError;

/// Delay before reconnecting a dropped printer socket.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Result of asking the schedule about an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the attempt after this delay.
    RetryAfter(Duration),
    /// Stop; every attempt has been used.
    Exhausted,
}

/// A fixed list of delays, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// 2 s, 3 s, 5 s, 7 s, 10 s.
    pub fn detection() -> Self {
        Self::new(
            [2000, 3000, 5000, 7000, 10000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32
    }

    /// Decision for the zero-based `attempt`.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        match self.delays.get(attempt as usize) {
            Some(delay) => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling attempt");
                RetryDecision::RetryAfter(*delay)
            }
            None => {
                warn!(attempt, max = self.max_attempts(), "retry schedule exhausted");
                RetryDecision::Exhausted
            }
        }
    }

    /// Like [`decide`](Self::decide), but gives up immediately on errors a
    /// retry cannot fix.
    pub fn decide_after(&self, err: &ChituiError, attempt: u32) -> RetryDecision {
        if !err.is_transient() {
            debug!(error = %err, "permanent error, not retrying");
            return RetryDecision::Exhausted;
        }
        self.decide(attempt)
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::detection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_schedule_has_five_attempts() {
        let schedule = RetrySchedule::detection();
        assert_eq!(schedule.max_attempts(), 5);
        assert_eq!(
            schedule.decide(0),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            schedule.decide(4),
            RetryDecision::RetryAfter(Duration::from_secs(10))
        );
        assert_eq!(schedule.decide(5), RetryDecision::Exhausted);
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let schedule = RetrySchedule::detection();
        let err = ChituiError::SessionRemoved("abc".into());
        assert_eq!(schedule.decide_after(&err, 0), RetryDecision::Exhausted);

        let transient = ChituiError::SessionNotConnected("abc".into());
        assert!(matches!(
            schedule.decide_after(&transient, 1),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn empty_schedule_is_exhausted() {
        assert_eq!(RetrySchedule::new(Vec::new()).decide(0), RetryDecision::Exhausted);
    }
}
