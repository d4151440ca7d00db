//! Detection of plans the planner keeps repeating within one step.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::types::Plan;

/// Tunables for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuplicateRules {
    /// How many prior plans are compared.
    pub window: usize,
    /// Word overlap strictly above which descriptions count as duplicates.
    pub similarity: f64,
    /// Matches inside the window that make a pattern.
    pub escalation: usize,
}

impl Default for DuplicateRules {
    fn default() -> Self {
        Self {
            window: 3,
            similarity: 0.8,
            escalation: 2,
        }
    }
}

/// Result of comparing a new plan against recent history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    /// Prior plans in the window that match.
    pub matches: usize,
    /// At least one match had the same action kind and primary selector.
    pub exact: bool,
    /// Match count reached the escalation threshold.
    pub pattern: bool,
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        self.matches > 0
    }
}

/// Compare `candidate` against the last `rules.window` entries of `history`.
pub fn check_duplicate(candidate: &Plan, history: &[Plan], rules: &DuplicateRules) -> DuplicateCheck {
    let start = history.len().saturating_sub(rules.window);
    let candidate_words = words(&candidate.description);
    let mut check = DuplicateCheck::default();

    for prior in &history[start..] {
        let same_target = prior.action_kind == candidate.action_kind
            && !candidate.target.primary_selector.is_empty()
            && prior.target.primary_selector == candidate.target.primary_selector;
        if same_target {
            check.matches += 1;
            check.exact = true;
            continue;
        }
        if word_overlap(&candidate_words, &words(&prior.description)) > rules.similarity {
            check.matches += 1;
        }
    }

    check.pattern = rules.escalation > 0 && check.matches >= rules.escalation;
    check
}

fn words(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Share of the candidate's words that also appear in the prior description.
fn word_overlap(candidate: &HashSet<String>, prior: &HashSet<String>) -> f64 {
    if candidate.is_empty() || prior.is_empty() {
        return 0.0;
    }
    let shared = candidate.intersection(prior).count();
    shared as f64 / candidate.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionKind, Target};

    fn plan(description: &str, kind: ActionKind, selector: &str) -> Plan {
        Plan::new(description, kind, Target::selector(selector))
    }

    #[test]
    fn same_action_and_selector_is_exact_duplicate() {
        let history = vec![plan("Press save", ActionKind::Click, "#save")];
        let candidate = plan("Click the save button again", ActionKind::Click, "#save");
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert!(check.is_duplicate());
        assert!(check.exact);
        assert!(!check.pattern);
    }

    #[test]
    fn same_selector_different_action_is_not_exact() {
        let history = vec![plan("Hover menu", ActionKind::Hover, "#menu")];
        let candidate = plan("Open the settings page", ActionKind::Click, "#menu");
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert!(!check.is_duplicate());
    }

    #[test]
    fn near_identical_description_is_duplicate() {
        let history = vec![plan(
            "Fill the email field with the user address",
            ActionKind::Fill,
            "#email",
        )];
        let candidate = plan(
            "Fill the email field with the user address",
            ActionKind::Fill,
            "input[name=email]",
        );
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert!(check.is_duplicate());
        assert!(!check.exact);
    }

    #[test]
    fn overlap_must_exceed_threshold() {
        // 4 of 5 words shared is exactly 0.8, which is not above the threshold.
        let history = vec![plan("open the user menu", ActionKind::Click, "#a")];
        let candidate = plan("open the user menu now", ActionKind::Click, "#b");
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert!(!check.is_duplicate());
    }

    #[test]
    fn only_plans_inside_window_are_compared() {
        let history = vec![
            plan("Click save", ActionKind::Click, "#save"),
            plan("Open menu", ActionKind::Click, "#menu"),
            plan("Type name", ActionKind::Fill, "#name"),
            plan("Pick role", ActionKind::Select, "#role"),
        ];
        let candidate = plan("Click save", ActionKind::Click, "#save");
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert!(!check.is_duplicate());
    }

    #[test]
    fn repeated_matches_escalate_to_pattern() {
        let history = vec![
            plan("Click save", ActionKind::Click, "#save"),
            plan("Click save", ActionKind::Click, "#save"),
        ];
        let candidate = plan("Click save", ActionKind::Click, "#save");
        let check = check_duplicate(&candidate, &history, &DuplicateRules::default());
        assert_eq!(check.matches, 2);
        assert!(check.pattern);
    }
}
