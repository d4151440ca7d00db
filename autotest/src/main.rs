//! Autonomous browser functional-test runner.
//!
//! Test cases and credentials live under `.autotest/`. `autotest run` drives
//! each requested case through its own browser session and prints one JSON
//! report per case.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use autotest::core::types::RunStatus;
use autotest::engine::Engine;
use autotest::exit_codes;
use autotest::io::bridge::ActuatorBridge;
use autotest::io::config::{EngineConfig, load_config};
use autotest::io::driver::ProcessDriver;
use autotest::io::init::{InitOptions, init_store};
use autotest::io::planner::CommandPlanner;
use autotest::io::store::{FileStore, Store};
use autotest::logging;
use autotest::report::RunReport;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{info, warn};

const DEFAULT_STORE_DIR: &str = ".autotest";
const DEFAULT_CONFIG: &str = ".autotest/config.toml";

#[derive(Parser)]
#[command(
    name = "autotest",
    version,
    about = "Autonomous browser functional-test runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autotest/` with a default config and an example test case.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run test cases concurrently and print one JSON report per case.
    Run {
        /// Test case ids.
        #[arg(long = "case", value_name = "ID", required = true, num_args = 1..)]
        cases: Vec<String>,
        /// Credentials id used for every case.
        #[arg(long, value_name = "ID")]
        credentials: String,
        #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the plan stored for a substep.
    ShowAction {
        #[arg(long, value_name = "ID")]
        substep: String,
        #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_store(Path::new(DEFAULT_STORE_DIR), &InitOptions { force })?;
            println!("{}", paths.root.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            cases,
            credentials,
            config,
        } => cmd_run(&config, cases, &credentials),
        Command::ShowAction { substep, config } => cmd_show_action(&config, &substep),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
}

fn cmd_run(config_path: &Path, cases: Vec<String>, credentials: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let reports = runtime()?.block_on(run_cases(config, cases, credentials))?;
    for report in &reports {
        let json = serde_json::to_string_pretty(report).context("serialize run report")?;
        println!("{json}");
    }
    Ok(exit_code_for(&reports))
}

/// One engine, driver process and worker thread per case; planner and store
/// are shared.
async fn run_cases(
    config: EngineConfig,
    cases: Vec<String>,
    credentials: &str,
) -> Result<Vec<RunReport>> {
    let planner = Arc::new(CommandPlanner::new(&config.planner)?);
    let store = Arc::new(FileStore::new(&config.store.dir));

    let mut engines = Vec::with_capacity(cases.len());
    for case in &cases {
        let bridge = ActuatorBridge::spawn(ProcessDriver::new(&config.driver), case)?;
        let engine = Engine::new(
            Arc::clone(&planner),
            bridge,
            Arc::clone(&store),
            config.clone(),
        );
        engines.push(engine);
    }
    info!(cases = cases.len(), "starting runs");

    let runs = engines
        .iter()
        .zip(&cases)
        .map(|(engine, case)| engine.run(case, credentials));
    let reports = join_all(runs).await;

    for engine in engines {
        if let Err(err) = engine.into_actuator().shutdown().await {
            warn!(err = %format!("{err:#}"), "driver worker did not shut down cleanly");
        }
    }
    Ok(reports)
}

fn cmd_show_action(config_path: &Path, substep: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = FileStore::new(&config.store.dir);
    let plan = runtime()?.block_on(store.get_action(substep))?;
    let Some(plan) = plan else {
        bail!("no action stored for substep {substep}");
    };
    let json = serde_json::to_string_pretty(&plan).context("serialize plan")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

/// Errors dominate failures, failures dominate passes.
fn exit_code_for(reports: &[RunReport]) -> i32 {
    if reports.iter().any(|r| r.status == RunStatus::Error) {
        exit_codes::SOME_ERRORED
    } else if reports.iter().any(|r| !r.passed()) {
        exit_codes::SOME_FAILED
    } else {
        exit_codes::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotest::core::state::{RunState, WindowLimits};
    use autotest::core::types::AdvanceReason;
    use autotest::report::AuthOutcome;
    use autotest::test_support::steps;
    use chrono::Utc;

    fn report(status: RunStatus) -> RunReport {
        let mut state = RunState::new("case", "cred", steps(1), WindowLimits::default());
        match status {
            RunStatus::Passed => {
                state.advance_step(AdvanceReason::Validated).expect("advance");
            }
            RunStatus::Error => state.fail("boom"),
            _ => {}
        }
        state.finalize();
        RunReport::from_state(&state, None, AuthOutcome::NotAttempted, 0, Utc::now())
    }

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["autotest", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_run_with_several_cases() {
        let cli = Cli::parse_from([
            "autotest",
            "run",
            "--case",
            "login",
            "checkout",
            "--credentials",
            "qa",
        ]);
        let Command::Run {
            cases,
            credentials,
            config,
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(cases, vec!["login".to_string(), "checkout".to_string()]);
        assert_eq!(credentials, "qa");
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn run_requires_a_case() {
        assert!(Cli::try_parse_from(["autotest", "run", "--credentials", "qa"]).is_err());
    }

    #[test]
    fn exit_code_prefers_errors_over_failures() {
        assert_eq!(exit_code_for(&[report(RunStatus::Passed)]), exit_codes::OK);
        assert_eq!(
            exit_code_for(&[report(RunStatus::Passed), report(RunStatus::Failed)]),
            exit_codes::SOME_FAILED
        );
        assert_eq!(
            exit_code_for(&[report(RunStatus::Failed), report(RunStatus::Error)]),
            exit_codes::SOME_ERRORED
        );
    }
}
