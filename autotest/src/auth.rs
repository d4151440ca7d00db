//! Bounded, best-effort login before the first step.
//!
//! The planner picks one login move at a time; the engine supplies the
//! credentials itself so the password never enters a prompt. Failing to log in
//! does not abort the run.

use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::types::{
    ActionKind, Credentials, LoginAction, LoginActionKind, LoginProgress, PageState, Plan, Step,
    Target,
};
use crate::error::EngineError;
use crate::io::actuator::Actuator;
use crate::io::bridge::is_worker_gone;
use crate::io::config::AuthConfig;
use crate::io::planner::{LoginCheckRequest, LoginRequest, Planner};
use crate::engine::within_budget;
use crate::report::AuthOutcome;

/// Milliseconds to wait when the planner asks for a redirect wait.
const REDIRECT_WAIT_MS: &str = "2000";

/// Navigate to the application and run the login loop.
///
/// Only a dead actuator worker or the run deadline passing is an error;
/// everything else ends in [`AuthOutcome::BestEffort`]. Every planner and
/// actuator call is capped by the time left before `deadline`.
#[instrument(skip_all, fields(credentials = %creds.id))]
pub async fn authenticate<P, A>(
    planner: &P,
    actuator: &A,
    creds: &Credentials,
    config: &AuthConfig,
    deadline: Instant,
) -> Result<AuthOutcome, EngineError>
where
    P: Planner + ?Sized,
    A: Actuator + ?Sized,
{
    match within_budget(deadline, actuator.navigate(&creds.web_url)).await? {
        Ok(result) if result.success => {}
        Ok(result) => {
            let reason = result.error.unwrap_or(result.message);
            return Ok(best_effort(0, format!("initial navigation failed: {reason}")));
        }
        Err(err) if is_worker_gone(&err) => return Err(EngineError::actuator(err)),
        Err(err) => return Ok(best_effort(0, format!("initial navigation failed: {err:#}"))),
    }

    let initial_url = creds.web_url.clone();
    let mut progress = LoginProgress {
        current_url: initial_url.clone(),
        ..LoginProgress::default()
    };

    while progress.attempts < config.max_attempts {
        remaining_budget(deadline)?;
        let page = match within_budget(deadline, actuator.page_state()).await? {
            Ok(page) => page,
            Err(err) if is_worker_gone(&err) => return Err(EngineError::actuator(err)),
            Err(err) => return Ok(best_effort(progress.attempts, format!("{err:#}"))),
        };
        progress.current_url = page.url().to_string();
        progress.attempts += 1;

        let request = LoginRequest {
            username: creds.username.clone(),
            progress: progress.clone(),
            max_attempts: config.max_attempts,
            page: page.clone(),
        };
        let action = match within_budget(deadline, planner.plan_login(&request)).await? {
            Ok(action) => action,
            Err(err) => {
                return Ok(best_effort(
                    progress.attempts,
                    format!("login planning failed: {err:#}"),
                ));
            }
        };
        debug!(kind = action.kind.as_str(), confidence = action.confidence, "login move");

        match &action.kind {
            LoginActionKind::Completed => {
                if confirm_login(planner, &page, &initial_url, config, deadline).await? {
                    info!(attempts = progress.attempts, "login confirmed");
                    return Ok(AuthOutcome::LoggedIn {
                        attempts: progress.attempts,
                    });
                }
            }
            LoginActionKind::Error => {
                return Ok(best_effort(progress.attempts, action.reason));
            }
            LoginActionKind::Other(kind) => {
                warn!(kind = %kind, "unknown login move, asking again");
            }
            kind => {
                let Some(plan) = login_action_to_plan(&action, creds) else {
                    warn!(kind = kind.as_str(), "login move without a target");
                    continue;
                };
                let succeeded = match within_budget(deadline, actuator.execute(&plan)).await? {
                    Ok(result) => result.success,
                    Err(err) if is_worker_gone(&err) => return Err(EngineError::actuator(err)),
                    Err(err) => {
                        warn!(err = %format!("{err:#}"), "login move failed");
                        false
                    }
                };
                match kind {
                    LoginActionKind::EnterEmail => progress.email_entered |= succeeded,
                    LoginActionKind::EnterPassword => progress.password_entered |= succeeded,
                    _ => {}
                }
            }
        }
    }

    Ok(best_effort(
        progress.attempts,
        format!("login not confirmed after {} attempts", progress.attempts),
    ))
}

async fn confirm_login<P: Planner + ?Sized>(
    planner: &P,
    page: &PageState,
    initial_url: &str,
    config: &AuthConfig,
    deadline: Instant,
) -> Result<bool, EngineError> {
    let request = LoginCheckRequest {
        page: page.clone(),
        initial_url: initial_url.to_string(),
        current_url: page.url().to_string(),
    };
    let confirmed = match within_budget(deadline, planner.validate_login(&request)).await? {
        Ok(verdict) if verdict.is_logged_in && verdict.confidence >= config.confidence_threshold => {
            true
        }
        Ok(verdict) => {
            debug!(confidence = verdict.confidence, reason = %verdict.reason, "login not confirmed");
            false
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "login validation failed");
            false
        }
    };
    Ok(confirmed)
}

fn best_effort(attempts: u32, reason: String) -> AuthOutcome {
    warn!(attempts, reason = %reason, "continuing without confirmed login");
    AuthOutcome::BestEffort { attempts, reason }
}

/// Turn a login move into an executable plan. `None` when the move needs a
/// target and has none, or is not an action at all.
pub fn login_action_to_plan(action: &LoginAction, creds: &Credentials) -> Option<Plan> {
    let target = || {
        action
            .target
            .clone()
            .filter(|t| t.candidates().next().is_some())
    };
    let plan = match action.kind {
        LoginActionKind::EnterEmail => {
            let mut plan = Plan::new("Enter username", ActionKind::Fill, target()?);
            plan.action_value = Some(creds.username.clone());
            plan
        }
        LoginActionKind::EnterPassword => {
            let mut plan = Plan::new("Enter password", ActionKind::Fill, target()?);
            plan.action_value = Some(creds.password.clone());
            plan
        }
        LoginActionKind::ClickNext => Plan::new("Click next", ActionKind::Click, target()?),
        LoginActionKind::ClickSubmit => Plan::new("Submit login", ActionKind::Click, target()?),
        LoginActionKind::WaitForRedirect => {
            let mut plan = Plan::new("Wait for redirect", ActionKind::Wait, Target::default());
            plan.action_value = Some(REDIRECT_WAIT_MS.to_string());
            plan
        }
        LoginActionKind::Completed | LoginActionKind::Error | LoginActionKind::Other(_) => {
            return None;
        }
    };
    Some(plan)
}

/// True when `step` is the login the engine already performed.
pub fn is_login_step(step: &Step, keywords: &[String]) -> bool {
    let action = step.action.trim().to_lowercase();
    if action.is_empty() {
        return true;
    }
    keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .any(|k| !k.is_empty() && action.contains(&k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{credentials, step};

    fn action(kind: LoginActionKind, selector: Option<&str>) -> LoginAction {
        LoginAction {
            kind,
            target: selector.map(Target::selector),
            reason: "r".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn password_move_fills_password_from_credentials() {
        let creds = credentials();
        let plan = login_action_to_plan(
            &action(LoginActionKind::EnterPassword, Some("#pw")),
            &creds,
        )
        .expect("plan");
        assert_eq!(plan.action_kind, ActionKind::Fill);
        assert_eq!(plan.target.primary_selector, "#pw");
        assert_eq!(plan.action_value.as_deref(), Some(creds.password.as_str()));
    }

    #[test]
    fn click_without_target_is_not_executable() {
        let creds = credentials();
        assert!(login_action_to_plan(&action(LoginActionKind::ClickSubmit, None), &creds).is_none());
        assert!(
            login_action_to_plan(&action(LoginActionKind::ClickSubmit, Some("  ")), &creds)
                .is_none()
        );
    }

    #[test]
    fn redirect_wait_needs_no_target() {
        let plan = login_action_to_plan(
            &action(LoginActionKind::WaitForRedirect, None),
            &credentials(),
        )
        .expect("plan");
        assert_eq!(plan.action_kind, ActionKind::Wait);
    }

    #[test]
    fn login_step_detection_uses_keywords_and_empty_action() {
        let keywords = AuthConfig::default().login_step_keywords;
        assert!(is_login_step(&step(0, "Log in as admin", "Dashboard"), &keywords));
        assert!(is_login_step(&step(0, "Đăng nhập hệ thống", "OK"), &keywords));
        assert!(is_login_step(&step(0, "  ", "Dashboard"), &keywords));
        assert!(!is_login_step(&step(0, "Open settings", "Settings"), &keywords));
    }
}
