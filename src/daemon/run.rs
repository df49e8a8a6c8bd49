//! The daemon's top-level ticking loop (§2, §5): one [`crate::scheduler::worker::Worker`]
//! per configured repo claiming and driving tasks, a slower reconciliation pass
//! sweeping done/in-bot/escalation/parent-verification/midpoint, and a relationship
//! tick that turns dependency/sub-issue signals into `blocked`/`queued` transitions.
//! Wired together here rather than in `main.rs` so it stays testable without a CLI.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::daemon::bootstrap::DaemonHandles;
use crate::daemon::{ControlMode, read_control_state};
use crate::reconcile::done::DoneReconciler;
use crate::reconcile::escalation::EscalationReconciler;
use crate::reconcile::in_bot::InBotReconciler;
use crate::reconcile::midpoint::MidpointLabeler;
use crate::reconcile::parent_verify::{ParentVerificationReconciler, VerifyPayload};
use crate::relationship::{self, BlockDecision, CapabilityLadder, EvidenceKind};
use crate::scheduler::worker::Worker;
use crate::store::models::{BlockedSource, Patch, PrState, TaskPatch, TaskStatus};

/// How often a repo worker re-runs its claim/heartbeat/stale-recovery tick.
const WORKER_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// How often the slower reconciliation + relationship pass runs per repo.
const RECONCILE_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Drive one repo's [`Worker`] forever: claim/heartbeat/stale-recovery on every
/// tick, spawning the stage pipeline for every task already in-progress under this
/// daemon that this process isn't already driving (newly claimed, or still
/// in-progress across a restart whose heartbeat is still fresh).
pub async fn run_repo_worker(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let mut running: HashSet<i64> = HashSet::new();
    let mut handles = tokio::task::JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let control = worker.read_control();
        let now_ms = crate::util::now_unix_ms();

        if let Err(err) = worker.heartbeat_tick(now_ms) {
            tracing::warn!(repo = %worker.repo, error = %err, "heartbeat tick failed");
        }

        let my_daemon_id = worker.daemon_id.clone();
        if let Err(err) = worker
            .stale_recovery_tick(now_ms, move |owner| owner == my_daemon_id)
            .await
        {
            tracing::warn!(repo = %worker.repo, error = %err, "stale recovery tick failed");
        }

        if control.mode == ControlMode::Running {
            if let Err(err) = worker.claim_tick(&control, now_ms).await {
                tracing::warn!(repo = %worker.repo, error = %err, "claim tick failed");
            }
        }

        match worker.store.list_tasks_by_status(TaskStatus::InProgress) {
            Ok(tasks) => {
                for task in tasks {
                    if task.repo != worker.repo {
                        continue;
                    }
                    if task.daemon_id.as_deref() != Some(worker.daemon_id.as_str()) {
                        continue;
                    }
                    if task.worker_id.as_deref() != Some(worker.worker_id.as_str()) {
                        continue;
                    }
                    if !running.insert(task.issue_number) {
                        continue;
                    }
                    let worker = worker.clone();
                    let issue_number = task.issue_number;
                    handles.spawn(async move {
                        if let Err(err) = worker.run_stage_pipeline(&task).await {
                            tracing::warn!(
                                repo = %worker.repo, issue = task.issue_number, error = %err,
                                "stage pipeline exited with an error",
                            );
                        }
                        issue_number
                    });
                }
            }
            Err(err) => tracing::warn!(repo = %worker.repo, error = %err, "failed to list in-progress tasks"),
        }

        while let Some(done) = handles.try_join_next() {
            if let Ok(issue_number) = done {
                running.remove(&issue_number);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(WORKER_TICK_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }

    // Drain: let in-flight stage pipelines finish before returning.
    while handles.join_next().await.is_some() {}
}

/// One reconciliation + relationship pass for a single repo (§4.E, §4.H).
async fn reconcile_tick(handles: &DaemonHandles, repo_config: &crate::config::RepoConfig, ladder: &CapabilityLadder) {
    let repo = repo_config.slug.clone();
    let bot_branch = repo_config.bot_branch_or_default();
    let base_branch = repo_config.base_branch_or_default();

    let midpoint = MidpointLabeler {
        store: handles.store.clone(),
        transport: handles.transport.clone(),
        label_cache: handles.label_cache.clone(),
        repo: repo.clone(),
    };
    fire_midpoint_for_merged_tasks(handles, &midpoint, &repo).await;

    let done = DoneReconciler {
        store: handles.store.clone(),
        transport: handles.transport.clone(),
        label_cache: handles.label_cache.clone(),
        repo: repo.clone(),
        base_branch,
    };
    if let Err(err) = done.tick().await {
        tracing::warn!(repo = %repo, error = %err, "done reconciler tick failed");
    }

    let in_bot = InBotReconciler {
        store: handles.store.clone(),
        transport: handles.transport.clone(),
        label_cache: handles.label_cache.clone(),
        repo: repo.clone(),
        bot_branch,
    };
    if let Err(err) = in_bot.tick().await {
        tracing::warn!(repo = %repo, error = %err, "in-bot reconciler tick failed");
    }

    let escalation = EscalationReconciler {
        store: handles.store.clone(),
        transport: handles.transport.clone(),
        label_cache: handles.label_cache.clone(),
        repo: repo.clone(),
    };
    if let Err(err) = escalation.tick().await {
        tracing::warn!(repo = %repo, error = %err, "escalation reconciler tick failed");
    }

    relationship_tick(handles, &repo, ladder).await;
}

/// Give in-progress tasks that already have a merged PR a head start on losing
/// their `in-progress` label, ahead of [`InBotReconciler`]'s own polling pass.
async fn fire_midpoint_for_merged_tasks(handles: &DaemonHandles, midpoint: &MidpointLabeler, repo: &str) {
    let Ok(tasks) = handles.store.list_tasks_by_status(TaskStatus::InProgress) else { return };
    for task in tasks.into_iter().filter(|t| t.repo == repo) {
        let merged = handles
            .store
            .list_pr_snapshots(repo, task.issue_number)
            .unwrap_or_default()
            .iter()
            .any(|pr| pr.state == PrState::Merged);
        if merged {
            midpoint.try_remove_in_progress(task.issue_number).await;
        }
    }
}

/// For every `queued`/`in-progress`/`blocked` task in `repo`, refetch its issue,
/// collect github + body dependency signals, and apply the blocking decision
/// (§4.E): an open dependency moves the task to `blocked(deps)`; a fully-covered,
/// all-closed dependency set clears a `blocked(deps)` task back to `queued`.
/// Also checks parent-verification eligibility and writes it back when satisfied.
async fn relationship_tick(handles: &DaemonHandles, repo: &str, ladder: &CapabilityLadder) {
    let statuses = [TaskStatus::Queued, TaskStatus::InProgress, TaskStatus::Blocked];
    let mut tasks = Vec::new();
    for status in statuses {
        match handles.store.list_tasks_by_status(status) {
            Ok(found) => tasks.extend(found.into_iter().filter(|t| t.repo == repo)),
            Err(err) => tracing::warn!(repo, error = %err, "failed to list tasks for relationship tick"),
        }
    }

    for task in tasks {
        let detail = match crate::github::ops::fetch_issue(handles.transport.as_ref(), repo, task.issue_number).await {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(repo, issue = task.issue_number, error = %err, "failed to refetch issue for relationship tick");
                continue;
            }
        };

        let report = relationship::fetch::collect_signals(
            handles.transport.as_ref(),
            ladder,
            repo,
            task.issue_number,
            &detail.body,
        )
        .await;

        match relationship::decide_blocking(&report) {
            BlockDecision::Blocked if task.status != TaskStatus::Blocked => {
                let delta = crate::queue::status_delta(&detail.labels, TaskStatus::Blocked);
                if apply_label_delta(handles, repo, &detail.node_id, &delta).await {
                    let patch = TaskPatch {
                        status: Some(TaskStatus::Blocked),
                        blocked_source: Some(Patch::Set(BlockedSource::Deps)),
                        ..Default::default()
                    };
                    let _ = handles.store.patch_task(repo, task.issue_number, &patch);
                }
            }
            BlockDecision::Unblocked if task.status == TaskStatus::Blocked && task.blocked_source == Some(BlockedSource::Deps) => {
                let delta = crate::queue::status_delta(&detail.labels, TaskStatus::Queued);
                if apply_label_delta(handles, repo, &detail.node_id, &delta).await {
                    let patch = TaskPatch {
                        status: Some(TaskStatus::Queued),
                        blocked_source: Some(Patch::Clear),
                        ..Default::default()
                    };
                    let _ = handles.store.patch_task(repo, task.issue_number, &patch);
                }
            }
            _ => {}
        }

        maybe_write_parent_verification(handles, repo, task.issue_number, &report).await;
    }
}

async fn apply_label_delta(handles: &DaemonHandles, repo: &str, node_id: &str, delta: &crate::queue::LabelDelta) -> bool {
    if delta.add.is_empty() && delta.remove.is_empty() {
        return true;
    }
    let Some((owner, name)) = repo.split_once('/') else { return false };
    crate::github::labels::mutate_issue_labels(handles.transport.as_ref(), &handles.label_cache, owner, name, node_id, delta)
        .await
        .is_ok()
}

/// If `report` shows this issue is eligible for parent verification, write back a
/// `RALPH_VERIFY:` comment and close it (§4.H). Evidence per sub-issue child comes
/// from that child's own merged-PR snapshots.
async fn maybe_write_parent_verification(
    handles: &DaemonHandles,
    repo: &str,
    issue_number: i64,
    report: &relationship::RelationshipReport,
) {
    let sub_issue_refs: Vec<&str> = report
        .signals
        .iter()
        .filter(|s| s.kind == relationship::SignalKind::SubIssue)
        .map(|s| s.reference.as_str())
        .collect();
    if sub_issue_refs.is_empty() {
        return;
    }

    let mut evidence = std::collections::HashMap::new();
    for reference in &sub_issue_refs {
        let Some((child_repo, child_number)) = reference.rsplit_once('#') else { continue };
        let Ok(child_number) = child_number.parse::<i64>() else { continue };
        let prs = handles.store.list_pr_snapshots(child_repo, child_number).unwrap_or_default();
        if prs.iter().any(|p| p.state == PrState::Merged) {
            evidence.insert(reference.to_string(), vec![EvidenceKind::Pr]);
        }
    }

    if !relationship::parent_verification_eligible(report, &evidence) {
        return;
    }

    let payload = VerifyPayload {
        version: 1,
        work_remains: false,
        confidence: "medium".to_string(),
        checked: sub_issue_refs.iter().map(|s| s.to_string()).collect(),
        why_satisfied: "all sub-issues closed with merged-PR evidence and no open blockers".to_string(),
        evidence: evidence.keys().cloned().collect(),
    };

    let writeback = ParentVerificationReconciler {
        store: handles.store.clone(),
        transport: handles.transport.clone(),
        label_cache: handles.label_cache.clone(),
        repo: repo.to_string(),
    };
    if let Err(err) = writeback.writeback(issue_number, &payload).await {
        tracing::warn!(repo, issue = issue_number, error = %err, "parent verification writeback failed");
    }
}

/// Run the reconciliation pass for every configured repo on a timer, until shutdown.
pub async fn run_reconcile_loop(handles: Arc<DaemonHandles>, mut shutdown: watch::Receiver<bool>) {
    let ladder = CapabilityLadder::new();
    loop {
        if *shutdown.borrow() {
            break;
        }
        for repo_config in &handles.config.repos {
            reconcile_tick(&handles, repo_config, &ladder).await;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONCILE_TICK_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// The `ralphd run` entry point: write this daemon's identity record, converge
/// workflow labels on every configured repo, spawn one worker loop plus a shared
/// reconcile loop, and block until a shutdown signal flips `control.json` to
/// `draining` and every loop drains out.
pub async fn run_daemon(config: Arc<crate::config::RalphConfig>) -> anyhow::Result<()> {
    config.ensure_control_root()?;
    let daemon_id = crate::daemon::bootstrap::new_daemon_id();
    crate::daemon::bootstrap::write_own_record(&config, &daemon_id)?;
    if !config.control_file_path.exists() {
        crate::daemon::write_atomic_json(&config.control_file_path, &crate::daemon::ControlState::default())
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let handles = Arc::new(DaemonHandles::new(config.clone(), daemon_id)?);

    for repo_config in &handles.config.repos {
        if let Err(err) = crate::github::ops::ensure_workflow_labels(handles.transport.as_ref(), &repo_config.slug).await {
            tracing::warn!(repo = %repo_config.slug, error = %err, "failed to converge workflow labels");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut join_set = tokio::task::JoinSet::new();

    for repo_config in &handles.config.repos {
        let agent_runner: Arc<dyn crate::scheduler::agent::AgentRunner> =
            Arc::new(crate::scheduler::agent::ProcessAgentRunner::new());
        let worker = Arc::new(handles.worker_for(&repo_config.slug, &format!("{}-worker", repo_config.slug), agent_runner));
        let rx = shutdown_rx.clone();
        join_set.spawn(run_repo_worker(worker, rx));
    }
    join_set.spawn(run_reconcile_loop(handles.clone(), shutdown_rx.clone()));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received, draining");
    let mut control = read_control_state(&handles.config.control_file_path);
    control.mode = ControlMode::Draining;
    let _ = crate::daemon::write_atomic_json(&handles.config.control_file_path, &control);
    let _ = shutdown_tx.send(true);

    while join_set.join_next().await.is_some() {}
    Ok(())
}

/// Diagnostic snapshot for the `ralphd doctor` subcommand (§4.C, §6): discover
/// every daemon-record candidate under the canonical and managed-legacy roots and
/// run the repair algorithm against them.
pub fn run_doctor_report(
    config: &crate::config::RalphConfig,
    managed_legacy_roots: &[std::path::PathBuf],
    repair: bool,
) -> crate::daemon::DoctorReport {
    let candidates = crate::daemon::bootstrap::discover_candidates(config, managed_legacy_roots);
    let now = crate::util::now_unix_ms_as_iso();
    crate::daemon::run_doctor(&candidates, &config.control_root, &now, repair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{GitHubApiError, GitHubErrorCode};
    use crate::github::labels::LabelIdCache;
    use crate::github::{GitHubTransport, RestResponse};
    use crate::store::Store;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::Value;

    struct PanicsIfCalled;

    #[async_trait]
    impl GitHubTransport for PanicsIfCalled {
        async fn rest(&self, _method: Method, _path: &str, _query: &[(&str, &str)], _body: Option<Value>) -> Result<RestResponse, GitHubApiError> {
            panic!("transport should not be called for an empty label delta");
        }
        async fn graphql(&self, _query: &str, _variables: Value) -> Result<Value, GitHubApiError> {
            panic!("transport should not be called for an empty label delta");
        }
    }

    struct AlwaysFailsTransport;

    #[async_trait]
    impl GitHubTransport for AlwaysFailsTransport {
        async fn rest(&self, _method: Method, _path: &str, _query: &[(&str, &str)], _body: Option<Value>) -> Result<RestResponse, GitHubApiError> {
            Err(GitHubApiError::new("boom", GitHubErrorCode::Server))
        }
        async fn graphql(&self, _query: &str, _variables: Value) -> Result<Value, GitHubApiError> {
            Err(GitHubApiError::new("boom", GitHubErrorCode::Server))
        }
    }

    fn handles_with_transport(transport: Arc<dyn GitHubTransport>) -> DaemonHandles {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let file = crate::config::RalphConfigFile {
            github_token: Some("ghp_test".to_string()),
            ..Default::default()
        };
        let config = Arc::new(crate::config::RalphConfig::from_file_and_env(file, false).unwrap());
        DaemonHandles {
            store,
            transport,
            label_cache: Arc::new(LabelIdCache::new()),
            coalescer: Arc::new(crate::ratelimit::Coalescer::new(Duration::from_millis(10))),
            config,
            daemon_id: "test-daemon".to_string(),
        }
    }

    #[tokio::test]
    async fn apply_label_delta_empty_is_a_noop() {
        let handles = handles_with_transport(Arc::new(PanicsIfCalled));
        let delta = crate::queue::LabelDelta::default();
        let applied = apply_label_delta(&handles, "acme/widgets", "node-1", &delta).await;
        assert!(applied);
    }

    #[tokio::test]
    async fn apply_label_delta_reports_transport_failure() {
        let handles = handles_with_transport(Arc::new(AlwaysFailsTransport));
        let delta = crate::queue::LabelDelta {
            add: vec!["ralph:status:blocked".to_string()],
            remove: vec!["ralph:status:queued".to_string()],
        };
        let applied = apply_label_delta(&handles, "acme/widgets", "node-1", &delta).await;
        assert!(!applied);
    }

    #[tokio::test]
    async fn apply_label_delta_rejects_malformed_repo_slug() {
        let handles = handles_with_transport(Arc::new(PanicsIfCalled));
        let delta = crate::queue::LabelDelta {
            add: vec!["ralph:status:blocked".to_string()],
            remove: vec![],
        };
        let applied = apply_label_delta(&handles, "not-a-slug", "node-1", &delta).await;
        assert!(!applied);
    }
}
