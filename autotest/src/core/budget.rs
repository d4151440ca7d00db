//! Run-level wall-clock budget.

use std::time::{Duration, Instant};

use crate::error::EngineError;

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration, EngineError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(EngineError::Timeout);
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_deadline_is_a_timeout() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(remaining_budget(deadline), Err(EngineError::Timeout)));
    }

    #[test]
    fn future_deadline_reports_remaining_time() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let remaining = remaining_budget(deadline).expect("budget left");
        assert!(remaining > Duration::from_secs(50));
    }
}
