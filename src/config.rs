//! Resolved runtime configuration for the ralph daemon (§4.J).
//!
//! Layered cheapest-wins-last: compiled-in [`defaults`], then an optional TOML file,
//! then environment variables, then explicit CLI flags (applied by `main.rs` before
//! [`RalphConfig::finish`] is called). This module only resolves values; it never
//! parses `clap` arguments itself so the core stays usable from tests without a CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Centrally fixed constants referenced from §9's "Open questions" resolution.
pub mod defaults {
    use std::time::Duration;

    pub const STALE_TTL: Duration = Duration::from_secs(5 * 60);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const COALESCE_WINDOW: Duration = Duration::from_millis(10);
    pub const REQUIRED_CHECKS_BACKOFF_BASE: Duration = Duration::from_secs(5);
    pub const REQUIRED_CHECKS_BACKOFF_MULTIPLIER: f64 = 1.5;
    pub const REQUIRED_CHECKS_BACKOFF_MAX: Duration = Duration::from_secs(300);
    pub const WALL_SOFT_MS: u64 = 10 * 60 * 1000;
    pub const WALL_HARD_MS: u64 = 20 * 60 * 1000;
    pub const TOOL_CALLS_SOFT: u32 = 200;
    pub const TOOL_CALLS_HARD: u32 = 400;
    pub const MAX_WORKERS: usize = 4;
    pub const SLOTS_PER_WORKER: usize = 2;
    pub const STAGE_PIPELINE: &[&str] = &["plan", "build", "verify", "gate", "pr"];
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RepoConfig {
    /// `owner/name`.
    pub slug: String,
    pub bot_branch: Option<String>,
    pub base_branch: Option<String>,
    pub max_slots: Option<usize>,
}

impl RepoConfig {
    pub fn bot_branch_or_default(&self) -> String {
        self.bot_branch.clone().unwrap_or_else(|| "bot/integration".to_string())
    }

    pub fn base_branch_or_default(&self) -> String {
        self.base_branch.clone().unwrap_or_else(|| "main".to_string())
    }
}

/// Raw shape of the optional TOML config file. Every field is optional; absence falls
/// through to environment variables, then to [`defaults`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RalphConfigFile {
    pub control_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub repos: Option<Vec<RepoConfig>>,
    pub max_workers: Option<usize>,
    pub stage_pipeline: Option<Vec<String>>,
    pub agent_command: Option<String>,
    pub agent_args: Option<Vec<String>>,
    pub wall_soft_ms: Option<u64>,
    pub wall_hard_ms: Option<u64>,
    pub tool_calls_soft: Option<u32>,
    pub tool_calls_hard: Option<u32>,
    pub github_app_id: Option<String>,
    pub github_installation_id: Option<i64>,
    pub github_private_key_path: Option<PathBuf>,
    pub github_token: Option<String>,
}

impl RalphConfigFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file at {}", path.display()))
    }
}

/// Which GitHub App credential shape is in play; a plain PAT is supported for
/// single-operator setups where App installation tokens would be overkill.
#[derive(Debug, Clone)]
pub enum GitHubAuth {
    App {
        app_id: String,
        installation_id: i64,
        private_key_path: PathBuf,
    },
    Token(String),
}

/// Fully resolved configuration the rest of the crate is built against.
#[derive(Debug, Clone)]
pub struct RalphConfig {
    pub control_root: PathBuf,
    pub database_path: PathBuf,
    pub daemon_registry_path: PathBuf,
    pub control_file_path: PathBuf,
    pub sessions_dir: PathBuf,
    pub repos: Vec<RepoConfig>,
    pub max_workers: usize,
    pub stage_pipeline: Vec<String>,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub heartbeat_interval: Duration,
    pub stale_ttl: Duration,
    pub coalesce_window: Duration,
    pub wall_soft_ms: u64,
    pub wall_hard_ms: u64,
    pub tool_calls_soft: u32,
    pub tool_calls_hard: u32,
    pub required_checks_backoff_base: Duration,
    pub required_checks_backoff_multiplier: f64,
    pub required_checks_backoff_max: Duration,
    pub github_auth: GitHubAuth,
    pub verbose: bool,
}

impl RalphConfig {
    /// Resolve the canonical control root: `$RALPH_CONTROL_ROOT` override, else
    /// `$HOME/.ralph/control`. Pure function of environment, per the teacher's
    /// `find_spec_file`-style resolver but without any filesystem probing.
    pub fn resolve_control_root() -> Result<PathBuf> {
        if let Ok(root) = std::env::var("RALPH_CONTROL_ROOT") {
            return Ok(PathBuf::from(root));
        }
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join(".ralph").join("control"))
    }

    pub fn from_file_and_env(file: RalphConfigFile, verbose: bool) -> Result<Self> {
        let control_root = match file.control_root.clone() {
            Some(root) => root,
            None => Self::resolve_control_root()?,
        };

        let database_path = file
            .database_path
            .clone()
            .or_else(|| std::env::var("RALPH_DATABASE_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| control_root.join("state.sqlite"));

        let daemon_registry_path = control_root.join("daemon-registry.json");
        let control_file_path = control_root.join("control.json");
        let sessions_dir = control_root.join("sessions");

        let repos = file.repos.unwrap_or_default();

        let max_workers = file
            .max_workers
            .or_else(|| {
                std::env::var("RALPH_MAX_WORKERS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(defaults::MAX_WORKERS);

        let stage_pipeline = file.stage_pipeline.unwrap_or_else(|| {
            defaults::STAGE_PIPELINE
                .iter()
                .map(|s| s.to_string())
                .collect()
        });

        let agent_command = file
            .agent_command
            .clone()
            .or_else(|| std::env::var("RALPH_AGENT_COMMAND").ok())
            .unwrap_or_else(|| "claude".to_string());
        let agent_args = file
            .agent_args
            .clone()
            .unwrap_or_else(|| vec!["-p".to_string(), "--output-format".to_string(), "stream-json".to_string()]);

        let github_auth = if let Some(token) = file
            .github_token
            .clone()
            .or_else(|| std::env::var("RALPH_GITHUB_TOKEN").ok())
        {
            GitHubAuth::Token(token)
        } else {
            let app_id = file
                .github_app_id
                .clone()
                .or_else(|| std::env::var("RALPH_GITHUB_APP_ID").ok())
                .context("no GitHub credential configured: set github_token or github_app_id")?;
            let private_key_path = file
                .github_private_key_path
                .clone()
                .or_else(|| {
                    std::env::var("RALPH_GITHUB_PRIVATE_KEY_PATH")
                        .ok()
                        .map(PathBuf::from)
                })
                .context("github_app_id set without github_private_key_path")?;
            let installation_id = file
                .github_installation_id
                .or_else(|| std::env::var("RALPH_GITHUB_INSTALLATION_ID").ok().and_then(|v| v.parse().ok()))
                .context("github_app_id set without github_installation_id")?;
            GitHubAuth::App {
                app_id,
                installation_id,
                private_key_path,
            }
        };

        let wall_soft_ms = file
            .wall_soft_ms
            .or_else(|| std::env::var("RALPH_WALL_SOFT_MS").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(defaults::WALL_SOFT_MS);
        let wall_hard_ms = file
            .wall_hard_ms
            .or_else(|| std::env::var("RALPH_WALL_HARD_MS").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(defaults::WALL_HARD_MS);
        let tool_calls_soft = file
            .tool_calls_soft
            .or_else(|| std::env::var("RALPH_TOOL_CALLS_SOFT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(defaults::TOOL_CALLS_SOFT);
        let tool_calls_hard = file
            .tool_calls_hard
            .or_else(|| std::env::var("RALPH_TOOL_CALLS_HARD").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(defaults::TOOL_CALLS_HARD);

        Ok(Self {
            control_root,
            database_path,
            daemon_registry_path,
            control_file_path,
            sessions_dir,
            repos,
            max_workers,
            stage_pipeline,
            agent_command,
            agent_args,
            heartbeat_interval: defaults::HEARTBEAT_INTERVAL,
            stale_ttl: defaults::STALE_TTL,
            coalesce_window: defaults::COALESCE_WINDOW,
            wall_soft_ms,
            wall_hard_ms,
            tool_calls_soft,
            tool_calls_hard,
            required_checks_backoff_base: defaults::REQUIRED_CHECKS_BACKOFF_BASE,
            required_checks_backoff_multiplier: defaults::REQUIRED_CHECKS_BACKOFF_MULTIPLIER,
            required_checks_backoff_max: defaults::REQUIRED_CHECKS_BACKOFF_MAX,
            github_auth,
            verbose,
        })
    }

    pub fn ensure_control_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.control_root)
            .context("failed to create control root directory")?;
        Ok(())
    }
}
