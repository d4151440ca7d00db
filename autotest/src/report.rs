//! Final, user-visible summary of one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::RunState;
use crate::core::types::{RunStatus, StepOutcome, SubstepResult};

/// How the login sub-protocol ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthOutcome {
    /// Setup failed before login was reached.
    NotAttempted,
    LoggedIn { attempts: u32 },
    /// Login was not confirmed; the run continued anyway.
    BestEffort { attempts: u32, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub total_steps: usize,
    pub completed_steps: usize,
    /// Steps whose goal was confirmed rather than given up on.
    pub validated_steps: usize,
    pub total_substeps: usize,
    pub passed_substeps: usize,
    pub failed_substeps: usize,
    /// Store writes that fell back to in-memory placeholders.
    pub degraded_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub test_case_id: String,
    pub credentials_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_name: Option<String>,
    pub status: RunStatus,
    pub totals: RunTotals,
    pub authentication: AuthOutcome,
    pub steps: Vec<StepOutcome>,
    pub substeps: Vec<SubstepResult>,
    /// First fatal message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn from_state(
        state: &RunState,
        test_case_name: Option<String>,
        authentication: AuthOutcome,
        degraded_writes: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        let substeps = state.execution_results().to_vec();
        let passed_substeps = substeps.iter().filter(|s| s.result.success).count();
        let totals = RunTotals {
            total_steps: state.steps().len(),
            completed_steps: state.completed_step_indices().len(),
            validated_steps: state
                .step_outcomes()
                .iter()
                .filter(|o| o.reason.is_confirmed())
                .count(),
            total_substeps: substeps.len(),
            passed_substeps,
            failed_substeps: substeps.len() - passed_substeps,
            degraded_writes,
        };
        Self {
            test_case_id: state.test_case_id().to_string(),
            credentials_id: state.credentials_id().to_string(),
            test_case_name,
            status: state.status(),
            totals,
            authentication,
            steps: state.step_outcomes().to_vec(),
            substeps,
            error_message: state.error_message().map(str::to_string),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::duplicate::DuplicateCheck;
    use crate::core::state::WindowLimits;
    use crate::core::types::{AdvanceReason, ExecResult, RecordId};
    use crate::test_support::{click_plan, steps};

    #[test]
    fn totals_count_substeps_and_confirmed_steps() {
        let mut state = RunState::new("case", "cred", steps(2), WindowLimits::default());
        let plan = click_plan("Click save", "#save");
        state.record_plan(plan.clone(), DuplicateCheck::default());
        state.record_result(RecordId::Stored("a".into()), &plan, ExecResult::failed("x", "y"));
        state.record_result(RecordId::Placeholder("b".into()), &plan, ExecResult::succeeded("ok"));
        state.advance_step(AdvanceReason::Validated).expect("advance");
        state.advance_step(AdvanceReason::SubstepCeiling).expect("advance");
        state.finalize();

        let report = RunReport::from_state(
            &state,
            Some("Case".to_string()),
            AuthOutcome::LoggedIn { attempts: 3 },
            1,
            Utc::now(),
        );
        assert!(report.passed());
        assert_eq!(report.totals.total_steps, 2);
        assert_eq!(report.totals.completed_steps, 2);
        assert_eq!(report.totals.validated_steps, 1);
        assert_eq!(report.totals.total_substeps, 2);
        assert_eq!(report.totals.passed_substeps, 1);
        assert_eq!(report.totals.failed_substeps, 1);
        assert_eq!(report.totals.degraded_writes, 1);
    }

    #[test]
    fn report_serializes_status_lowercase() {
        let mut state = RunState::new("case", "cred", Vec::new(), WindowLimits::default());
        state.fail("no steps");
        let report =
            RunReport::from_state(&state, None, AuthOutcome::NotAttempted, 0, Utc::now());
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "error");
        assert_eq!(json["authentication"]["outcome"], "not_attempted");
        assert_eq!(json["error_message"], "no steps");
    }
}
