//! Guard against plans that would tear down the authenticated session.

use crate::core::types::{ActionKind, Plan, Step, Target, Verification};

/// Decides whether a plan ends the session.
pub trait DestructiveActionPolicy: Send + Sync {
    fn is_destructive(&self, plan: &Plan) -> bool;

    /// True when the step's action, not its expected result, asks for the
    /// destructive action.
    fn step_requires(&self, step: &Step) -> bool;
}

/// Keyword match over plan description and target, case-insensitive.
#[derive(Debug, Clone)]
pub struct KeywordPolicy {
    keywords: Vec<String>,
}

pub const DEFAULT_DESTRUCTIVE_KEYWORDS: &[&str] =
    &["logout", "log out", "sign out", "signout", "đăng xuất"];

impl Default for KeywordPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DESTRUCTIVE_KEYWORDS.iter().copied())
    }
}

impl KeywordPolicy {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    fn mentions(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

impl DestructiveActionPolicy for KeywordPolicy {
    fn is_destructive(&self, plan: &Plan) -> bool {
        if self.mentions(&plan.description) {
            return true;
        }
        let target = &plan.target;
        target.description.as_deref().is_some_and(|d| self.mentions(d))
            || self.mentions(&target.primary_selector)
    }

    fn step_requires(&self, step: &Step) -> bool {
        self.mentions(&step.action)
    }
}

/// Outcome of [`guard_plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded {
    Unchanged(Plan),
    /// The plan was replaced by a final verification.
    Downgraded { original: String, plan: Plan },
}

impl Guarded {
    pub fn into_plan(self) -> Plan {
        match self {
            Guarded::Unchanged(plan) | Guarded::Downgraded { plan, .. } => plan,
        }
    }
}

/// Replace a session-ending plan with a final verification of the step goal,
/// unless the step itself asks for it.
pub fn guard_plan(plan: Plan, step: &Step, policy: &dyn DestructiveActionPolicy) -> Guarded {
    if !policy.is_destructive(&plan) || policy.step_requires(step) {
        return Guarded::Unchanged(plan);
    }
    let original = plan.description.clone();
    let mut downgraded = Plan::new(
        format!("Verify goal achieved: {}", step.expected_result),
        ActionKind::Verify,
        Target::default(),
    );
    downgraded.verification = Verification::default();
    downgraded.is_final = true;
    downgraded.extra = plan.extra;
    Guarded::Downgraded {
        original,
        plan: downgraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: &str, expected: &str) -> Step {
        Step {
            id: "s1".to_string(),
            order: 1,
            action: action.to_string(),
            expected_result: expected.to_string(),
            comment: None,
        }
    }

    #[test]
    fn sign_out_plan_is_downgraded_to_final_verify() {
        let plan = Plan::new(
            "Click Sign Out in the header",
            ActionKind::Click,
            Target::selector("#user-menu .signout"),
        );
        let guarded = guard_plan(
            plan,
            &step("Open the profile", "Profile page shows the email"),
            &KeywordPolicy::default(),
        );
        let Guarded::Downgraded { original, plan } = guarded else {
            panic!("expected downgrade");
        };
        assert_eq!(original, "Click Sign Out in the header");
        assert_eq!(plan.action_kind, ActionKind::Verify);
        assert!(plan.is_final);
        assert_eq!(
            plan.description,
            "Verify goal achieved: Profile page shows the email"
        );
    }

    #[test]
    fn step_that_asks_for_logout_keeps_the_plan() {
        let plan = Plan::new("Click Logout", ActionKind::Click, Target::selector("#logout"));
        let guarded = guard_plan(
            plan.clone(),
            &step("Log out of the application", "Login page is shown"),
            &KeywordPolicy::default(),
        );
        assert_eq!(guarded, Guarded::Unchanged(plan));
    }

    #[test]
    fn logout_in_expected_result_does_not_disable_guard() {
        let plan = Plan::new(
            "Click Logout in the header",
            ActionKind::Click,
            Target::selector("#logout"),
        );
        let guarded = guard_plan(
            plan,
            &step(
                "Open the profile page",
                "Profile page shows the user email and a Logout button",
            ),
            &KeywordPolicy::default(),
        );
        assert!(matches!(guarded, Guarded::Downgraded { .. }));
    }

    #[test]
    fn custom_keywords_replace_defaults() {
        let policy = KeywordPolicy::new(["delete account"]);
        let plan = Plan::new("Click logout", ActionKind::Click, Target::selector("#x"));
        assert!(!policy.is_destructive(&plan));

        let plan = Plan::new("Click Delete Account", ActionKind::Click, Target::selector("#x"));
        assert!(policy.is_destructive(&plan));
    }

    #[test]
    fn vietnamese_keyword_matches() {
        let plan = Plan::new("Nhấn Đăng xuất", ActionKind::Click, Target::selector("#x"));
        assert!(KeywordPolicy::default().is_destructive(&plan));
    }
}
