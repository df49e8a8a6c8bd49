use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ralphd")]
#[command(version, about = "Autonomous task orchestrator driving AI coding agents against GitHub issues")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a TOML config file. Defaults to `$RALPH_CONTROL_ROOT/config.toml` if present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the daemon: claim queued tasks, drive the stage pipeline, reconcile
    /// outcomes back onto GitHub, and relationship/blocking-check on a timer.
    Run,
    /// Report daemon-identity health as JSON and exit non-zero on any error finding.
    Doctor {
        /// Apply recommended repairs (quarantine stale/duplicate records) instead of
        /// only reporting them.
        #[arg(long)]
        repair: bool,
    },
    /// Request the running daemon transition to `paused` mode via the control file.
    Pause,
    /// Clear a pause request, returning the running daemon to `running` mode.
    Resume,
    /// Request the running daemon drain: finish in-flight stages, accept no new
    /// claims, then exit.
    Drain,
}

fn load_config(path: Option<&PathBuf>, verbose: bool) -> Result<ralph::config::RalphConfig> {
    let file = match path {
        Some(p) => ralph::config::RalphConfigFile::load(p)?,
        None => {
            let control_root = ralph::config::RalphConfig::resolve_control_root()?;
            let default_path = control_root.join("config.toml");
            if default_path.exists() {
                ralph::config::RalphConfigFile::load(&default_path)?
            } else {
                ralph::config::RalphConfigFile::default()
            }
        }
    };
    ralph::config::RalphConfig::from_file_and_env(file, verbose)
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| filter.to_string()),
        ))
        .try_init();
}

fn write_control_mutation(config: &ralph::config::RalphConfig, apply: impl FnOnce(&mut ralph::daemon::ControlState)) -> Result<()> {
    config.ensure_control_root()?;
    let mut state = ralph::daemon::read_control_state(&config.control_file_path);
    apply(&mut state);
    ralph::daemon::write_atomic_json(&config.control_file_path, &state)
        .map_err(|e| anyhow::anyhow!("failed to write control file: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.as_ref(), cli.verbose).context("failed to resolve configuration")?;
            ralph::daemon::run::run_daemon(Arc::new(config)).await?;
        }
        Commands::Doctor { repair } => {
            let config = load_config(cli.config.as_ref(), cli.verbose).context("failed to resolve configuration")?;
            let report = ralph::daemon::run::run_doctor_report(&config, &[], repair);
            let is_error = report.overall_status == "error";
            println!("{}", serde_json::to_string_pretty(&report)?);
            if is_error {
                std::process::exit(1);
            }
        }
        Commands::Pause => {
            let config = load_config(cli.config.as_ref(), cli.verbose).context("failed to resolve configuration")?;
            write_control_mutation(&config, |state| {
                state.mode = ralph::daemon::ControlMode::Paused;
                state.pause_requested = Some(true);
            })?;
            println!("control file updated: mode=paused");
        }
        Commands::Resume => {
            let config = load_config(cli.config.as_ref(), cli.verbose).context("failed to resolve configuration")?;
            write_control_mutation(&config, |state| {
                state.mode = ralph::daemon::ControlMode::Running;
                state.pause_requested = Some(false);
                state.pause_at_checkpoint = None;
            })?;
            println!("control file updated: mode=running");
        }
        Commands::Drain => {
            let config = load_config(cli.config.as_ref(), cli.verbose).context("failed to resolve configuration")?;
            write_control_mutation(&config, |state| {
                state.mode = ralph::daemon::ControlMode::Draining;
            })?;
            println!("control file updated: mode=draining");
        }
    }

    Ok(())
}
