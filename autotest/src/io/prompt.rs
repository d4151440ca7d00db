//! Prompt rendering for the command planner.
//!
//! Templates mark sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order and the last section (the page context) is
//! truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::planner::{LoginCheckRequest, LoginRequest, PlanRequest, ValidateRequest};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const VALIDATE_TEMPLATE: &str = include_str!("prompts/validate.md");
const LOGIN_TEMPLATE: &str = include_str!("prompts/login.md");
const LOGIN_VALIDATE_TEMPLATE: &str = include_str!("prompts/login_validate.md");

const DROP_ORDER: [&str; 2] = ["history", "evidence"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

/// Renders planner prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("validate", VALIDATE_TEMPLATE)
            .context("load validate template")?;
        env.add_template("login", LOGIN_TEMPLATE)
            .context("load login template")?;
        env.add_template("login_validate", LOGIN_VALIDATE_TEMPLATE)
            .context("load login_validate template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn plan(&self, request: &PlanRequest) -> Result<String> {
        let page = &request.page;
        let rendered = self.env.get_template("plan")?.render(context! {
            step => &request.step,
            step_number => request.step_index + 1,
            total_steps => request.total_steps,
            substep_number => request.substep_index + 1,
            max_substeps => request.max_substeps,
            stuck => request.stuck,
            duplicate_matches => request.duplicate.matches,
            duplicate_pattern => request.duplicate.pattern,
            last_validation => &request.last_validation,
            history => &request.history,
            page_url => page.url(),
            page_title => &page.title,
            page_context => page_context(&page.context)?,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn validate(&self, request: &ValidateRequest) -> Result<String> {
        let page = &request.page;
        let rendered = self.env.get_template("validate")?.render(context! {
            step_goal => &request.step_goal,
            expected => &request.expected,
            history => &request.history,
            before_evidence => &request.before_evidence,
            after_evidence => &request.after_evidence,
            page_url => page.url(),
            page_title => &page.title,
            page_context => page_context(&page.context)?,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn login(&self, request: &LoginRequest) -> Result<String> {
        let page = &request.page;
        let rendered = self.env.get_template("login")?.render(context! {
            username => &request.username,
            progress => &request.progress,
            max_attempts => request.max_attempts,
            page_url => page.url(),
            page_title => &page.title,
            page_context => page_context(&page.context)?,
        })?;
        Ok(self.fit(&rendered))
    }

    pub fn login_check(&self, request: &LoginCheckRequest) -> Result<String> {
        let page = &request.page;
        let rendered = self.env.get_template("login_validate")?.render(context! {
            initial_url => &request.initial_url,
            current_url => &request.current_url,
            page_url => page.url(),
            page_title => &page.title,
            page_context => page_context(&page.context)?,
        })?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn page_context(context: &serde_json::Value) -> Result<String> {
    match context {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::String(text) => Ok(text.clone()),
        other => serde_json::to_string_pretty(other).context("serialize page context"),
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let before_len = last.content.len();
    let mut keep = before_len.saturating_sub(over + TRUNCATION_MARKER.len());
    while keep > 0 && !last.content.is_char_boundary(keep) {
        keep -= 1;
    }
    last.content.truncate(keep);
    last.content.push_str(TRUNCATION_MARKER);
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated prompt section for budget"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::duplicate::DuplicateCheck;
    use crate::core::types::{LoginProgress, PageSnapshot, PageState, Step};
    use crate::io::planner::HistoryEntry;
    use serde_json::json;

    fn page(context: &str) -> PageState {
        PageState {
            snapshot: PageSnapshot::new("https://app.test/settings", 7),
            title: Some("Settings".to_string()),
            context: json!(context),
        }
    }

    fn plan_request(history: Vec<HistoryEntry>, context: &str) -> PlanRequest {
        PlanRequest {
            step: Step {
                id: "s1".to_string(),
                order: 1,
                action: "Open the notifications tab".to_string(),
                expected_result: "Notification toggles are listed".to_string(),
                comment: None,
            },
            step_index: 0,
            total_steps: 3,
            substep_index: 1,
            max_substeps: 10,
            page: page(context),
            history,
            stuck: true,
            duplicate: DuplicateCheck {
                matches: 1,
                exact: true,
                pattern: false,
            },
            last_validation: None,
        }
    }

    fn entry(n: u32) -> HistoryEntry {
        HistoryEntry {
            substep: n,
            description: format!("Click tab {n}"),
            action_kind: "click".to_string(),
            success: false,
            message: "Timeout 5000ms exceeded".to_string(),
            hint: Some("element was not found in time; try another selector".to_string()),
            intermediate_progress: None,
        }
    }

    /// Plan prompts carry the step, the signals and the page, in that order.
    #[test]
    fn plan_prompt_sections_are_ordered() {
        let builder = PromptBuilder::new(20_000).expect("builder");
        let prompt = builder
            .plan(&plan_request(vec![entry(1)], "<nav>tabs</nav>"))
            .expect("render");

        let contract = prompt.find("### Planner Contract").expect("contract");
        let step = prompt.find("### Step").expect("step");
        let signals = prompt.find("### Signals").expect("signals");
        let history = prompt.find("### History").expect("history");
        let page = prompt.find("### Page").expect("page");
        assert!(contract < step && step < signals && signals < history && history < page);
        assert!(prompt.contains("Step 1 of 3, substep 2"));
        assert!(prompt.contains("has not changed"));
        assert!(prompt.contains("hint: element was not found"));
        assert!(!prompt.contains("<!-- section"));
    }

    /// Empty history leaves no history heading behind.
    #[test]
    fn empty_history_section_is_omitted() {
        let builder = PromptBuilder::new(20_000).expect("builder");
        let prompt = builder
            .plan(&plan_request(Vec::new(), "body"))
            .expect("render");
        assert!(!prompt.contains("### History"));
    }

    /// Over budget, history goes first and the page is cut down last.
    #[test]
    fn budget_drops_history_then_truncates_page() {
        let builder = PromptBuilder::new(1_800).expect("builder");
        let history = (1..=20).map(entry).collect();
        let prompt = builder
            .plan(&plan_request(history, &"x".repeat(5_000)))
            .expect("render");

        assert!(!prompt.contains("### History"));
        assert!(prompt.contains("### Output"));
        assert!(prompt.ends_with("[truncated]"));
        assert!(prompt.len() <= 1_800 + 2 * 8);
    }

    #[test]
    fn login_prompt_never_contains_password_field() {
        let builder = PromptBuilder::new(20_000).expect("builder");
        let prompt = builder
            .login(&LoginRequest {
                username: "qa@example.com".to_string(),
                progress: LoginProgress::default(),
                max_attempts: 8,
                page: page("<form>login</form>"),
            })
            .expect("render");
        assert!(prompt.contains("Account: qa@example.com"));
        assert!(prompt.contains("Attempt: 0 of 8"));
    }
}
