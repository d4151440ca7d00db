//! Consecutive failure and no-change counters for the current step.

use serde::{Deserialize, Serialize};

/// Counts consecutive actuator failures and consecutive unchanged validations.
///
/// Both counters reset on the matching positive signal. The failure counter is
/// run-level for the circuit breaker but is also cleared on step advance, so the
/// breaker only trips on failures that happen back to back inside one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLedger {
    consecutive_failures: u32,
    consecutive_no_change: u32,
}

impl RetryLedger {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_no_change(&self) -> u32 {
        self.consecutive_no_change
    }

    /// Record an execution outcome.
    pub fn record_execution(&mut self, success: bool) {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    /// Record whether the validation-time page equals the previous one.
    pub fn record_page_change(&mut self, unchanged: bool) {
        if unchanged {
            self.consecutive_no_change = self.consecutive_no_change.saturating_add(1);
        } else {
            self.consecutive_no_change = 0;
        }
    }

    /// A confident completion verdict clears the failure streak.
    pub fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn failures_at_least(&self, limit: u32) -> bool {
        self.consecutive_failures >= limit
    }

    pub fn no_change_at_least(&self, limit: u32) -> bool {
        self.consecutive_no_change >= limit
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn with_counts(consecutive_failures: u32, consecutive_no_change: u32) -> Self {
        Self {
            consecutive_failures,
            consecutive_no_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_accumulate_and_reset_on_success() {
        let mut ledger = RetryLedger::default();
        ledger.record_execution(false);
        ledger.record_execution(false);
        assert_eq!(ledger.consecutive_failures(), 2);
        assert!(ledger.failures_at_least(2));

        ledger.record_execution(true);
        assert_eq!(ledger.consecutive_failures(), 0);
    }

    #[test]
    fn no_change_resets_when_page_moves() {
        let mut ledger = RetryLedger::default();
        for _ in 0..3 {
            ledger.record_page_change(true);
        }
        assert!(ledger.no_change_at_least(3));

        ledger.record_page_change(false);
        assert_eq!(ledger.consecutive_no_change(), 0);
    }

    #[test]
    fn counters_are_independent() {
        let mut ledger = RetryLedger::default();
        ledger.record_execution(false);
        ledger.record_page_change(true);
        ledger.clear_failures();
        assert_eq!(ledger.consecutive_failures(), 0);
        assert_eq!(ledger.consecutive_no_change(), 1);
    }
}
