//! Run-state invariants checked after every transition.

use crate::core::state::RunState;
use crate::core::types::RunStatus;

/// Check structural invariants of a run:
/// - `current_step_index <= steps.len()`
/// - completed indices are valid step indices and never ahead of the cursor
/// - recorded results never belong to a future step
/// - `passed` only when every step is completed
pub fn validate_run_invariants(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();
    let total = state.steps().len();
    let index = state.current_step_index();

    if index > total {
        errors.push(format!(
            "current step index {index} exceeds step count {total}"
        ));
    }

    for &completed in state.completed_step_indices() {
        if completed >= total {
            errors.push(format!("completed index {completed} is not a step"));
        }
        if completed > index {
            errors.push(format!(
                "completed index {completed} is ahead of current step {index}"
            ));
        }
    }

    if let Some(result) = state
        .execution_results()
        .iter()
        .find(|r| r.step_index > index)
    {
        errors.push(format!(
            "result {} recorded for future step {}",
            result.substep_id, result.step_index
        ));
    }

    if state.status() == RunStatus::Passed && state.completed_step_indices().len() < total {
        errors.push(format!(
            "status passed with {} of {total} steps completed",
            state.completed_step_indices().len()
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::WindowLimits;
    use crate::core::types::{AdvanceReason, Step};

    fn state(n: usize) -> RunState {
        let steps = (0..n)
            .map(|i| Step {
                id: format!("s{i}"),
                order: i as u32,
                action: String::new(),
                expected_result: String::new(),
                comment: None,
            })
            .collect();
        RunState::new("c", "k", steps, WindowLimits::default())
    }

    #[test]
    fn normal_progress_keeps_invariants() {
        let mut state = state(2);
        assert!(validate_run_invariants(&state).is_empty());
        state.advance_step(AdvanceReason::Validated).expect("advance");
        state.advance_step(AdvanceReason::Validated).expect("advance");
        state.finalize();
        assert!(validate_run_invariants(&state).is_empty());
    }

    #[test]
    fn completed_index_ahead_of_cursor_is_reported() {
        let mut state = state(3);
        state.force_completed(2);
        let errors = validate_run_invariants(&state);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ahead of current step"));
    }

    #[test]
    fn out_of_range_cursor_is_reported() {
        let mut state = state(1);
        state.force_step_index(3);
        let errors = validate_run_invariants(&state);
        assert!(errors.iter().any(|e| e.contains("exceeds step count")));
    }
}
