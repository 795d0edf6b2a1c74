//! Wall-clock budget for one run.
//!
//! # Invariants
//! - `check()` fails once `elapsed() >= limit`, so a zero budget is exhausted immediately
//! - The budget never resets while a run is being processed

use std::time::{Duration, Instant};

/// The run has used up its wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wall-clock budget of {limit_ms}ms exceeded after {elapsed_ms}ms")]
pub struct DeadlineExceeded {
    pub limit_ms: u64,
    pub elapsed_ms: u64,
}

/// Run-wide deadline shared by every node of a run.
#[derive(Debug, Clone, Copy)]
pub struct WallClockBudget {
    started: Instant,
    limit: Duration,
}

impl WallClockBudget {
    /// Start the clock now.
    pub fn new(limit: Duration) -> Self {
        Self::starting_at(Instant::now(), limit)
    }

    pub fn from_millis(limit_ms: u64) -> Self {
        Self::new(Duration::from_millis(limit_ms))
    }

    pub fn starting_at(started: Instant, limit: Duration) -> Self {
        Self { started, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn check(&self) -> Result<(), DeadlineExceeded> {
        let elapsed = self.elapsed();
        if elapsed >= self.limit {
            return Err(DeadlineExceeded {
                limit_ms: self.limit.as_millis() as u64,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_is_exhausted_immediately() {
        let budget = WallClockBudget::from_millis(0);
        let err = budget.check().unwrap_err();
        assert_eq!(err.limit_ms, 0);
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_generous_budget_passes() {
        let budget = WallClockBudget::new(Duration::from_secs(3600));
        assert!(budget.check().is_ok());
        assert!(budget.remaining() > Duration::from_secs(3500));
    }

    #[test]
    fn test_started_in_the_past() {
        let started = Instant::now() - Duration::from_millis(50);
        let budget = WallClockBudget::starting_at(started, Duration::from_millis(10));
        let err = budget.check().unwrap_err();
        assert!(err.elapsed_ms >= 50);
    }
}
