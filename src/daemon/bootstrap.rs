//! Daemon-identity bootstrap glue (§4.C): enumerating the canonical + managed-legacy
//! daemon record paths on disk, writing this process's own record, and running the
//! top-level ticking loop the `ralphd run` CLI entry point drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::RalphConfig;
use crate::daemon::{Candidate, DaemonRecord, classify_candidate};

/// Filenames a daemon record might be quarantined under, in addition to its live
/// name, so a doctor scan picks up both live and already-quarantined records.
const RECORD_BASENAME: &str = "daemon-registry.json";

/// List every daemon-record path worth classifying under `control_root` and each of
/// `managed_legacy_roots`: the live name plus any quarantine-suffixed siblings.
pub fn discover_candidate_paths(control_root: &Path, managed_legacy_roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut roots = vec![control_root.to_path_buf()];
    roots.extend(managed_legacy_roots.iter().cloned());

    let mut paths = Vec::new();
    for root in &roots {
        let live = root.join(RECORD_BASENAME);
        if live.exists() {
            paths.push(live);
        }
        let Ok(entries) = std::fs::read_dir(root) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(RECORD_BASENAME) && name.as_ref() != RECORD_BASENAME {
                paths.push(entry.path());
            }
        }
    }
    paths
}

/// Classify every discovered candidate under `config`'s control root.
pub fn discover_candidates(config: &RalphConfig, managed_legacy_roots: &[PathBuf]) -> Vec<Candidate> {
    discover_candidate_paths(&config.control_root, managed_legacy_roots)
        .into_iter()
        .map(|path| classify_candidate(&path, &config.control_root, managed_legacy_roots))
        .collect()
}

/// Build this process's own [`DaemonRecord`] and write it to the canonical path.
pub fn write_own_record(config: &RalphConfig, daemon_id: &str) -> Result<DaemonRecord> {
    let now = crate::util::now_unix_ms_as_iso();
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let command: Vec<String> = std::env::args().collect();
    let record = DaemonRecord {
        version: 1,
        daemon_id: daemon_id.to_string(),
        pid: std::process::id() as i32,
        started_at: now.clone(),
        heartbeat_at: now,
        control_root: config.control_root.clone(),
        control_file_path: config.control_file_path.clone(),
        cwd,
        command,
        ralph_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    crate::daemon::write_atomic_json(&config.daemon_registry_path, &record)
        .map_err(|e| anyhow::anyhow!("failed to write daemon record: {e}"))?;
    Ok(record)
}

/// Refresh this daemon's own `heartbeatAt` field in its on-disk record.
pub fn heartbeat_own_record(config: &RalphConfig, record: &DaemonRecord) -> Result<()> {
    let mut updated = record.clone();
    updated.heartbeat_at = crate::util::now_unix_ms_as_iso();
    crate::daemon::write_atomic_json(&config.daemon_registry_path, &updated)
        .map_err(|e| anyhow::anyhow!("failed to refresh daemon heartbeat: {e}"))
}

/// Construct a fresh [`uuid`]-backed daemon id, the way the teacher mints run/session
/// ids elsewhere in the crate.
pub fn new_daemon_id() -> String {
    format!("daemon-{}", uuid::Uuid::new_v4())
}

pub fn is_pid_alive_for_doctor(pid: i32) -> bool {
    crate::daemon::is_pid_alive(pid)
}

/// Everything a running daemon needs shared across its per-repo workers and the
/// reconciler loop.
pub struct DaemonHandles {
    pub store: Arc<crate::store::Store>,
    pub transport: Arc<dyn crate::github::GitHubTransport>,
    pub label_cache: Arc<crate::github::labels::LabelIdCache>,
    pub coalescer: Arc<crate::ratelimit::Coalescer>,
    pub config: Arc<RalphConfig>,
    pub daemon_id: String,
}

impl DaemonHandles {
    pub fn new(config: Arc<RalphConfig>, daemon_id: String) -> Result<Self, crate::errors::StoreError> {
        let store = Arc::new(crate::store::Store::open(&config.database_path)?);
        let token_provider: Arc<dyn crate::github::GitHubTokenProvider> = match &config.github_auth {
            crate::config::GitHubAuth::App { app_id, installation_id, private_key_path } => {
                let signer = crate::github::auth::RsaAppJwtSigner::from_pem_file(private_key_path)
                    .map_err(|e| crate::errors::StoreError::Other(anyhow::anyhow!("{e}")))?;
                Arc::new(crate::github::AppInstallationTokenProvider::new(
                    reqwest::Client::new(),
                    app_id.clone(),
                    *installation_id,
                    Arc::new(signer),
                ))
            }
            crate::config::GitHubAuth::Token(token) => {
                Arc::new(crate::github::StaticTokenProvider(token.clone()))
            }
        };
        let transport: Arc<dyn crate::github::GitHubTransport> =
            Arc::new(crate::github::HttpGitHubClient::new(token_provider));

        Ok(Self {
            store,
            transport,
            label_cache: Arc::new(crate::github::labels::LabelIdCache::new()),
            coalescer: Arc::new(crate::ratelimit::Coalescer::new(config.coalesce_window)),
            config,
            daemon_id,
        })
    }

    pub fn worker_for(&self, repo: &str, worker_id: &str, agent_runner: Arc<dyn crate::scheduler::agent::AgentRunner>) -> crate::scheduler::worker::Worker {
        crate::scheduler::worker::Worker {
            store: self.store.clone(),
            transport: self.transport.clone(),
            label_cache: self.label_cache.clone(),
            coalescer: self.coalescer.clone(),
            agent_runner,
            config: self.config.clone(),
            repo: repo.to_string(),
            daemon_id: self.daemon_id.clone(),
            worker_id: worker_id.to_string(),
        }
    }
}
