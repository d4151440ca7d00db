//! Post-action re-verification and the confidence-weighted override.
//!
//! Both rules only ever move a result from failure to success, never back.

use crate::core::types::{ExecResult, ValidationVerdict};

const REVERIFIED_SUFFIX: &str = " (verified post-action)";

/// Upgrade a failed result whose own verification clause now holds.
///
/// `verification_holds` is the outcome of re-checking the plan's verification
/// against the current page. Returns true when the result was upgraded.
pub fn reverify(result: &mut ExecResult, verification_holds: bool) -> bool {
    if result.success || !verification_holds {
        return false;
    }
    result.success = true;
    result.reverified = true;
    result.message.push_str(REVERIFIED_SUFFIX);
    true
}

/// Record a confident validation verdict on the result and flip a failed
/// result to success when it says the step is complete.
///
/// Verdicts below `threshold` leave the result untouched. The flip happens at
/// most once per result. Returns true when it happened.
pub fn apply_override(result: &mut ExecResult, verdict: &ValidationVerdict, threshold: f64) -> bool {
    if verdict.confidence < threshold {
        return false;
    }
    result.llm_validated = Some(verdict.is_completed);
    result.validation_reason = Some(verdict.reason.clone());

    if result.success || result.overridden || !verdict.is_completed {
        return false;
    }
    result.success = true;
    result.overridden = true;
    result
        .message
        .push_str(&format!(" (LLM validated: {})", verdict.reason));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(is_completed: bool, confidence: f64) -> ValidationVerdict {
        ValidationVerdict {
            is_completed,
            confidence,
            reason: "dialog closed".to_string(),
            evidence: String::new(),
        }
    }

    #[test]
    fn failed_result_is_upgraded_when_verification_holds() {
        let mut result = ExecResult::failed("Clicked save", "timeout waiting for toast");
        assert!(reverify(&mut result, true));
        assert!(result.success);
        assert!(result.reverified);
        assert_eq!(result.message, "Clicked save (verified post-action)");
    }

    #[test]
    fn reverify_is_idempotent_on_success() {
        let mut result = ExecResult::succeeded("Clicked save");
        assert!(!reverify(&mut result, false));
        assert!(!reverify(&mut result, true));
        assert!(result.success);
        assert_eq!(result.message, "Clicked save");

        let mut upgraded = ExecResult::failed("Clicked", "raced");
        reverify(&mut upgraded, true);
        let once = upgraded.clone();
        reverify(&mut upgraded, false);
        reverify(&mut upgraded, true);
        assert_eq!(upgraded, once);
    }

    #[test]
    fn failed_check_leaves_failure_in_place() {
        let mut result = ExecResult::failed("Clicked", "not found");
        assert!(!reverify(&mut result, false));
        assert!(!result.success);
    }

    #[test]
    fn confident_completion_overrides_failure_once() {
        let mut result = ExecResult::failed("Clicked close", "element detached");
        assert!(apply_override(&mut result, &verdict(true, 0.9), 0.7));
        assert!(result.success);
        assert!(result.overridden);
        assert_eq!(result.llm_validated, Some(true));
        assert!(result.message.ends_with("(LLM validated: dialog closed)"));

        let message = result.message.clone();
        assert!(!apply_override(&mut result, &verdict(true, 0.95), 0.7));
        assert_eq!(result.message, message);
    }

    #[test]
    fn low_confidence_or_incomplete_verdict_does_not_override() {
        let mut result = ExecResult::failed("Clicked", "x");
        assert!(!apply_override(&mut result, &verdict(true, 0.69), 0.7));
        assert!(!apply_override(&mut result, &verdict(false, 0.99), 0.7));
        assert!(!result.success);
        assert_eq!(result.llm_validated, Some(false));
    }

    #[test]
    fn low_confidence_verdict_is_not_recorded() {
        let mut result = ExecResult::failed("Clicked", "x");
        assert!(!apply_override(&mut result, &verdict(true, 0.3), 0.7));
        assert_eq!(result.llm_validated, None);
        assert_eq!(result.validation_reason, None);
        assert_eq!(result, ExecResult::failed("Clicked", "x"));
    }
}
