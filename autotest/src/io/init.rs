//! Scaffolding for the `.autotest/` store directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{EngineConfig, write_config};

/// Canonical paths inside a store directory.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub cases_dir: PathBuf,
    pub credentials_dir: PathBuf,
    pub substeps_dir: PathBuf,
    pub actions_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.toml"),
            cases_dir: root.join("cases"),
            credentials_dir: root.join("credentials"),
            substeps_dir: root.join("substeps"),
            actions_dir: root.join("actions"),
            screenshots_dir: root.join("screenshots"),
            results_dir: root.join("results"),
            root,
        }
    }

    pub fn case_path(&self, id: &str) -> PathBuf {
        self.cases_dir.join(format!("{id}.toml"))
    }

    pub fn credentials_path(&self, id: &str) -> PathBuf {
        self.credentials_dir.join(format!("{id}.toml"))
    }

    fn record_dirs(&self) -> [&Path; 6] {
        [
            &self.cases_dir,
            &self.credentials_dir,
            &self.substeps_dir,
            &self.actions_dir,
            &self.screenshots_dir,
            &self.results_dir,
        ]
    }
}

/// Options for [`init_store`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config and example files.
    pub force: bool,
}

/// Create the store layout, a default `config.toml` and an example case.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_store(root: &Path, options: &InitOptions) -> Result<StorePaths> {
    let paths = StorePaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "autotest init: {} exists but is not a directory",
            paths.root.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "autotest init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in paths.record_dirs() {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    write_config(&paths.config_path, &EngineConfig::default())?;
    write_file(&paths.case_path("example"), EXAMPLE_CASE)?;
    write_file(&paths.credentials_path("example"), EXAMPLE_CREDENTIALS)?;
    write_file(&paths.root.join(".gitignore"), STORE_GITIGNORE)?;

    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

const STORE_GITIGNORE: &str = "credentials/\nsubsteps/\nactions/\nscreenshots/\nresults/\n";

const EXAMPLE_CASE: &str = r#"id = "example"
name = "Update display name"

[[steps]]
id = "example-1"
order = 1
action = "Log in with the test account"
expected_result = "The dashboard is shown"

[[steps]]
id = "example-2"
order = 2
action = "Open the profile settings and change the display name to QA Bot"
expected_result = "A confirmation message is shown and the header shows QA Bot"
"#;

const EXAMPLE_CREDENTIALS: &str = r#"id = "example"
username = "qa@example.com"
password = "change-me"
web_url = "https://app.example.com/login"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_layout_and_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join(".autotest");
        let paths = init_store(&root, &InitOptions { force: false }).expect("init");

        for dir in paths.record_dirs() {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }
        let cfg = load_config(&paths.config_path).expect("load config");
        assert_eq!(cfg, EngineConfig::default());
        assert!(paths.case_path("example").is_file());
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join(".autotest");
        init_store(&root, &InitOptions { force: false }).expect("first init");

        let err = init_store(&root, &InitOptions { force: false }).expect_err("second init");
        assert!(err.to_string().contains("--force"));

        init_store(&root, &InitOptions { force: true }).expect("forced init");
    }
}
