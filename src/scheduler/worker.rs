//! Per-repo worker (§4.G): the concrete tick a daemon drives for one configured
//! repository, built on the pure claim/guardrail/classify/stage logic in
//! [`super`]. One [`Worker`] owns one repo's slot budget; the daemon entry point
//! constructs one per configured repo and drives their ticks concurrently.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::RalphConfig;
use crate::daemon::{ControlState, read_control_state};
use crate::errors::SchedulerError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::queue::{self, LabelDelta};
use crate::ratelimit::{Coalescer, LabelWriteBackoff};
use crate::scheduler::agent::{AgentInvocationSpec, AgentRunner, GuardrailKind};
use crate::scheduler::classify::{self, FailureClass};
use crate::scheduler::guardrail::GuardrailLimits;
use crate::scheduler::stage;
use crate::scheduler::{self, ClaimCandidate, ClaimPlan};
use crate::store::models::{RunOutcome, Task, TaskStatus};
use crate::store::{Store, idempotency};

/// Everything one repo's worker needs, shared (cheaply cloned) across ticks.
pub struct Worker {
    pub store: Arc<Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub coalescer: Arc<Coalescer>,
    pub agent_runner: Arc<dyn AgentRunner>,
    pub config: Arc<RalphConfig>,
    /// `owner/name`.
    pub repo: String,
    pub daemon_id: String,
    pub worker_id: String,
}

impl Worker {
    fn owner_and_name(&self) -> (&str, &str) {
        self.repo.split_once('/').unwrap_or((self.repo.as_str(), ""))
    }

    fn max_slots(&self) -> usize {
        self.config
            .repos
            .iter()
            .find(|r| r.slug == self.repo)
            .and_then(|r| r.max_slots)
            .unwrap_or(crate::config::defaults::SLOTS_PER_WORKER)
    }

    pub fn read_control(&self) -> ControlState {
        read_control_state(&self.config.control_file_path)
    }

    /// Claim phase: project queued tasks against their label snapshot, compute how
    /// many may be claimed this tick, and claim each one (label mutation then task
    /// row update). Returns how many tasks were actually claimed.
    pub async fn claim_tick(&self, control: &ControlState, now_ms: i64) -> Result<usize, SchedulerError> {
        let mut candidates = Vec::new();
        for task in self.store.list_tasks_by_status(TaskStatus::Queued)? {
            if task.repo != self.repo {
                continue;
            }
            let labels = self
                .store
                .get_issue_snapshot(&task.repo, task.issue_number)?
                .map(|s| s.labels)
                .unwrap_or_default();
            candidates.push(ClaimCandidate { task, labels });
        }

        let already_running = self
            .store
            .list_tasks_by_status(TaskStatus::InProgress)?
            .into_iter()
            .filter(|t| t.repo == self.repo)
            .count();

        let plans = scheduler::plan_claims_for_tick(
            candidates,
            control,
            &self.daemon_id,
            &self.worker_id,
            already_running,
            self.max_slots(),
            now_ms,
        );

        let mut claimed = 0;
        for plan in &plans {
            if self.apply_claim(plan).await? {
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn apply_claim(&self, plan: &ClaimPlan) -> Result<bool, SchedulerError> {
        if !self.mutate_labels(plan.issue_number, &plan.label_delta).await? {
            return Ok(false);
        }
        self.store.patch_task(&plan.repo, plan.issue_number, &plan.patch)?;
        Ok(true)
    }

    /// Heartbeat phase: refresh `heartbeatAt` on every in-progress task this
    /// worker/daemon pair owns.
    pub fn heartbeat_tick(&self, now_ms: i64) -> Result<usize, SchedulerError> {
        let mut updated = 0;
        for task in self.store.list_tasks_by_status(TaskStatus::InProgress)? {
            if task.repo != self.repo {
                continue;
            }
            if task.daemon_id.as_deref() != Some(self.daemon_id.as_str()) {
                continue;
            }
            if task.worker_id.as_deref() != Some(self.worker_id.as_str()) {
                continue;
            }
            self.store
                .patch_task(&task.repo, task.issue_number, &scheduler::heartbeat_patch(now_ms))?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Stale-recovery phase: find in-progress tasks whose heartbeat has gone quiet
    /// under a dead or foreign owner, reset them to `queued`, and heal the label.
    pub async fn stale_recovery_tick(
        &self,
        now_ms: i64,
        owner_is_alive: impl Fn(&str) -> bool,
    ) -> Result<usize, SchedulerError> {
        let stale_ttl_ms = self.config.stale_ttl.as_millis() as i64;
        let mut recovered = 0;
        for task in self.store.list_tasks_by_status(TaskStatus::InProgress)? {
            if task.repo != self.repo {
                continue;
            }
            let stale = scheduler::is_stale(&task, now_ms, stale_ttl_ms, &self.daemon_id, |d| {
                owner_is_alive(d)
            });
            if !stale {
                continue;
            }
            self.store
                .patch_task(&task.repo, task.issue_number, &scheduler::recover_stale_patch())?;
            if let Some(snapshot) = self.store.get_issue_snapshot(&task.repo, task.issue_number)? {
                let delta = queue::status_delta(&snapshot.labels, TaskStatus::Queued);
                let _ = self.mutate_labels(task.issue_number, &delta).await;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Apply a label delta to one issue through the coalescer and the per-repo
    /// write backoff (§4.I). Returns `false` (without erroring) when the circuit is
    /// open or the mutation failed, so callers leave the task row untouched and
    /// retry on a later tick rather than treating a label-write hiccup as fatal.
    async fn mutate_labels(&self, issue_number: i64, delta: &LabelDelta) -> Result<bool, SchedulerError> {
        if delta.add.is_empty() && delta.remove.is_empty() {
            return Ok(true);
        }

        let now_ms = crate::util::now_unix_ms();
        {
            let conn = self.store.conn();
            if !LabelWriteBackoff::new(&conn).can_attempt(&self.repo, now_ms)? {
                return Ok(false);
            }
        }

        let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? else {
            return Ok(false);
        };

        let (owner, name) = self.owner_and_name();
        let (owner, name) = (owner.to_string(), name.to_string());
        let labelable_id = snapshot.github_node_id;
        let transport = self.transport.clone();
        let cache = self.label_cache.clone();
        let delta = delta.clone();

        let result = self
            .coalescer
            .run(&self.repo, issue_number, move || {
                let transport = transport.clone();
                let cache = cache.clone();
                async move {
                    mutate_issue_labels(transport.as_ref(), &cache, &owner, &name, &labelable_id, &delta)
                        .await
                        .map_err(|e| format!("{:?}|{}", classify::classify_github_error(&e.code), e.message))
                }
            })
            .await;

        let conn = self.store.conn();
        let backoff = LabelWriteBackoff::new(&conn);
        match result {
            Ok(()) => {
                backoff.record_success(&self.repo)?;
                Ok(true)
            }
            Err(tagged) => {
                let is_rate_limit = tagged.starts_with("RateLimit|");
                if is_rate_limit {
                    backoff.record_failure(&self.repo, now_ms + 60_000, &tagged)?;
                }
                Ok(false)
            }
        }
    }

    /// Drive one claimed task through its configured stage pipeline, starting from
    /// its recorded checkpoint, honoring pause requests between stages (§4.G).
    pub async fn run_stage_pipeline(&self, task: &Task) -> Result<(), SchedulerError> {
        stage::validate_pipeline(&self.config.stage_pipeline)?;
        let mut index = stage::resume_index(&self.config.stage_pipeline, task.checkpoint.as_deref())?;
        let limits = GuardrailLimits::from_config(&self.config);

        while index < self.config.stage_pipeline.len() {
            let stage_name = &self.config.stage_pipeline[index];

            let control = self.read_control();
            if stage::should_pause_at(&control, stage_name) {
                self.store.patch_task(
                    &task.repo,
                    task.issue_number,
                    &crate::store::models::TaskPatch {
                        pause_requested: Some(true),
                        paused_at_checkpoint: Some(crate::store::models::Patch::Set(stage_name.clone())),
                        status: Some(TaskStatus::Paused),
                        ..Default::default()
                    },
                )?;
                self.wait_for_unpause().await;
                self.store.patch_task(
                    &task.repo,
                    task.issue_number,
                    &crate::store::models::TaskPatch {
                        status: Some(TaskStatus::InProgress),
                        pause_requested: Some(false),
                        paused_at_checkpoint: Some(crate::store::models::Patch::Clear),
                        ..Default::default()
                    },
                )?;
            }

            match self.run_one_stage(task, stage_name, task.checkpoint_seq, &limits).await? {
                StageOutcome::Advanced => {
                    index += 1;
                }
                StageOutcome::Retry => {
                    // terminal_patch already returned the task to queued/throttled;
                    // the claim loop will pick it back up on a future tick.
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn wait_for_unpause(&self) {
        let mut attempt = 0;
        loop {
            if self.read_control().pause_requested != Some(true) {
                return;
            }
            tokio::time::sleep(stage::pause_wait_backoff(attempt)).await;
            attempt += 1;
        }
    }

    async fn run_one_stage(
        &self,
        task: &Task,
        stage_name: &str,
        checkpoint_seq: i64,
        limits: &GuardrailLimits,
    ) -> Result<StageOutcome, SchedulerError> {
        let checkpoint_key = stage::checkpoint_key(&task.repo, task.issue_number, stage_name, checkpoint_seq);
        let step_key = stage::step_key(&task.task_path, stage_name, checkpoint_seq);

        let worktree_path = task
            .worktree_path
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| SchedulerError::Other(anyhow::anyhow!("task has no worktree to run the agent in")))?;
        let session_id = task
            .session_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}-{}", task.task_path.replace('/', "-"), checkpoint_seq));
        let events_path = self.config.sessions_dir.join(&session_id).join("events.jsonl");

        let run = self.store.create_run(&task.repo, task.issue_number, &task.task_path, stage_name)?;

        let spec = AgentInvocationSpec {
            command: self.config.agent_command.clone(),
            args: self.config.agent_args.clone(),
            cwd: worktree_path,
            prompt: stage_prompt(stage_name, task),
            events_path,
            step_key,
        };

        let mut outcome = self.agent_runner.invoke(&spec, *limits).await?;
        self.store.record_run_session_use(run.id, &session_id, Some(stage_name), Some(&self.config.agent_command))?;

        if scheduler::compaction::is_context_exhausted(&outcome.stdout_tail, &outcome.stderr_tail) {
            outcome = self.run_compaction_retry(task, &spec, *limits).await?;
        }

        if let Some(kind) = outcome.guardrail_kill {
            self.store.complete_run(
                run.id,
                RunOutcome::Failed,
                Some(&format!(
                    "{{\"success\":false,\"guardrailTimeout\":{{\"kind\":\"guardrail-timeout\",\"reason\":\"{}\"}}}}",
                    kind.as_str()
                )),
            )?;
            return self.handle_guardrail_kill(task, kind).await;
        }

        if outcome.exit_code != Some(0) {
            self.store.complete_run(run.id, RunOutcome::Failed, Some(&outcome.stderr_tail))?;
            let class = classify::classify_agent_exit(outcome.exit_code, false);
            return self.handle_failure(task, class).await;
        }

        self.store.complete_run(run.id, RunOutcome::Success, None)?;

        if idempotency::claim(&self.store.conn(), &checkpoint_key, "checkpoint")? {
            self.store.patch_task(
                &task.repo,
                task.issue_number,
                &crate::store::models::TaskPatch {
                    checkpoint: Some(crate::store::models::Patch::Set(stage_name.to_string())),
                    checkpoint_seq: Some(checkpoint_seq + 1),
                    session_id: Some(crate::store::models::Patch::Set(session_id)),
                    ..Default::default()
                },
            )?;
        }
        Ok(StageOutcome::Advanced)
    }

    /// Instruct the session to compact, then resume the stage with a prompt
    /// rebuilt around the task's plan path and current git status (§4.G).
    async fn run_compaction_retry(
        &self,
        task: &Task,
        spec: &AgentInvocationSpec,
        limits: GuardrailLimits,
    ) -> Result<crate::scheduler::agent::AgentInvocationOutcome, SchedulerError> {
        let compact_spec = AgentInvocationSpec {
            prompt: scheduler::compaction::compact_instruction().to_string(),
            step_key: format!("{}:compact", spec.step_key),
            ..spec.clone()
        };
        let _ = self.agent_runner.invoke(&compact_spec, limits).await?;

        let resumed_spec = AgentInvocationSpec {
            prompt: scheduler::compaction::rebuild_prompt(&spec.prompt, task, &spec.cwd),
            step_key: format!("{}:resumed", spec.step_key),
            ..spec.clone()
        };
        self.agent_runner.invoke(&resumed_spec, limits).await
    }

    async fn handle_failure(
        &self,
        task: &Task,
        class: FailureClass,
    ) -> Result<StageOutcome, SchedulerError> {
        let resume_at_ms = match class {
            FailureClass::RateLimit => Some(crate::util::now_unix_ms() + 60_000),
            _ => None,
        };
        let patch = scheduler::terminal_patch(class, resume_at_ms);
        self.apply_failure_patch(task, patch).await
    }

    /// Guardrail hard-kill path (§4.G, §8 scenario S5): returns the task to `queued`
    /// and bumps `watchdog_retries`, independent of the generic exit-code classifier.
    async fn handle_guardrail_kill(
        &self,
        task: &Task,
        _kind: GuardrailKind,
    ) -> Result<StageOutcome, SchedulerError> {
        let patch = scheduler::guardrail_kill_patch(TaskStatus::Queued, task.watchdog_retries);
        self.apply_failure_patch(task, patch).await
    }

    async fn apply_failure_patch(
        &self,
        task: &Task,
        patch: crate::store::models::TaskPatch,
    ) -> Result<StageOutcome, SchedulerError> {
        self.store.patch_task(&task.repo, task.issue_number, &patch)?;

        if let Some(status) = patch.status {
            if let Some(snapshot) = self.store.get_issue_snapshot(&task.repo, task.issue_number)? {
                let delta = queue::status_delta(&snapshot.labels, status);
                let _ = self.mutate_labels(task.issue_number, &delta).await;
            }
        }
        Ok(StageOutcome::Retry)
    }
}

#[derive(Debug, PartialEq)]
enum StageOutcome {
    Advanced,
    Retry,
}

/// Build the stage-specific prompt the agent receives over stdin. Intentionally
/// minimal here; the actual prompt templates live with the repo's task generation
/// surface, not the scheduler.
fn stage_prompt(stage_name: &str, task: &Task) -> String {
    format!(
        "Run stage `{stage_name}` for {repo}#{issue} (task path: {task_path}).",
        repo = task.repo,
        issue = task.issue_number,
        task_path = task.task_path,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::RestResponse;
    use crate::scheduler::agent::AgentInvocationOutcome;
    use crate::store::models::{IssueSnapshot, TaskPatch};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct NullTransport;

    #[async_trait]
    impl GitHubTransport for NullTransport {
        async fn rest(
            &self,
            _method: reqwest::Method,
            _path: &str,
            _query: &[(&str, &str)],
            _body: Option<Value>,
        ) -> Result<RestResponse, crate::errors::GitHubApiError> {
            unimplemented!()
        }

        async fn graphql(&self, query: &str, _variables: Value) -> Result<Value, crate::errors::GitHubApiError> {
            if query.contains("labels(first") {
                Ok(json!({
                    "repository": {
                        "id": "R_1",
                        "labels": {
                            "nodes": [
                                {"id": "L_queued", "name": "ralph:status:queued"},
                                {"id": "L_progress", "name": "ralph:status:in-progress"},
                            ],
                            "pageInfo": {"hasNextPage": false, "endCursor": null},
                        },
                    }
                }))
            } else {
                Ok(json!({ "clientMutationId": null }))
            }
        }
    }

    struct AlwaysSucceedsRunner;

    #[async_trait]
    impl AgentRunner for AlwaysSucceedsRunner {
        async fn invoke(
            &self,
            _spec: &AgentInvocationSpec,
            _limits: GuardrailLimits,
        ) -> Result<AgentInvocationOutcome, SchedulerError> {
            Ok(AgentInvocationOutcome {
                exit_code: Some(0),
                guardrail_kill: None,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
            })
        }
    }

    fn test_config() -> RalphConfig {
        let dir = tempfile::TempDir::new().unwrap();
        let control_root = dir.keep();
        RalphConfig {
            control_root: control_root.clone(),
            database_path: control_root.join("state.sqlite"),
            daemon_registry_path: control_root.join("daemon-registry.json"),
            control_file_path: control_root.join("control.json"),
            sessions_dir: control_root.join("sessions"),
            repos: vec![],
            max_workers: 1,
            stage_pipeline: vec!["plan".to_string(), "build".to_string()],
            agent_command: "claude".to_string(),
            agent_args: vec![],
            heartbeat_interval: std::time::Duration::from_secs(30),
            stale_ttl: std::time::Duration::from_secs(300),
            coalesce_window: std::time::Duration::from_millis(1),
            wall_soft_ms: 600_000,
            wall_hard_ms: 1_200_000,
            tool_calls_soft: 200,
            tool_calls_hard: 400,
            required_checks_backoff_base: std::time::Duration::from_secs(5),
            required_checks_backoff_multiplier: 1.5,
            required_checks_backoff_max: std::time::Duration::from_secs(300),
            github_auth: crate::config::GitHubAuth::Token("ghp_test".to_string()),
            verbose: false,
        }
    }

    struct CompactsOnceRunner {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl AgentRunner for CompactsOnceRunner {
        async fn invoke(
            &self,
            _spec: &AgentInvocationSpec,
            _limits: GuardrailLimits,
        ) -> Result<AgentInvocationOutcome, SchedulerError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                Ok(AgentInvocationOutcome {
                    exit_code: Some(0),
                    guardrail_kill: None,
                    stdout_tail: "RALPH_CONTEXT_EXHAUSTED".to_string(),
                    stderr_tail: String::new(),
                })
            } else {
                Ok(AgentInvocationOutcome {
                    exit_code: Some(0),
                    guardrail_kill: None,
                    stdout_tail: String::new(),
                    stderr_tail: String::new(),
                })
            }
        }
    }

    struct GuardrailKillsRunner {
        kind: GuardrailKind,
    }

    #[async_trait]
    impl AgentRunner for GuardrailKillsRunner {
        async fn invoke(
            &self,
            _spec: &AgentInvocationSpec,
            _limits: GuardrailLimits,
        ) -> Result<AgentInvocationOutcome, SchedulerError> {
            Ok(AgentInvocationOutcome {
                exit_code: None,
                guardrail_kill: Some(self.kind),
                stdout_tail: String::new(),
                stderr_tail: String::new(),
            })
        }
    }

    fn worker(store: Arc<Store>) -> Worker {
        Worker {
            store,
            transport: Arc::new(NullTransport),
            label_cache: Arc::new(LabelIdCache::new()),
            coalescer: Arc::new(Coalescer::new(std::time::Duration::from_millis(1))),
            agent_runner: Arc::new(AlwaysSucceedsRunner),
            config: Arc::new(test_config()),
            repo: "acme/widgets".to_string(),
            daemon_id: "daemon-1".to_string(),
            worker_id: "worker-1".to_string(),
        }
    }

    fn seed_task(store: &Store, issue_number: i64, status: TaskStatus) {
        store
            .upsert_task(&Task {
                repo: "acme/widgets".to_string(),
                issue_number,
                task_path: format!("tasks/{issue_number}.md"),
                status,
                session_id: None,
                worker_id: None,
                repo_slot: None,
                daemon_id: None,
                heartbeat_at: None,
                worktree_path: Some("/tmp".to_string()),
                checkpoint: None,
                checkpoint_seq: 0,
                pause_requested: false,
                paused_at_checkpoint: None,
                blocked_source: None,
                resume_at: None,
                watchdog_retries: 0,
            })
            .unwrap();
    }

    fn seed_snapshot(store: &Store, issue_number: i64, labels: &[&str]) {
        store
            .upsert_issue_snapshot(&IssueSnapshot {
                repo: "acme/widgets".to_string(),
                issue_number,
                title: "t".to_string(),
                state: "open".to_string(),
                url: "https://github.com/acme/widgets/issues/1".to_string(),
                github_node_id: "I_1".to_string(),
                github_updated_at: "2026-01-01T00:00:00Z".to_string(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn claim_tick_claims_a_claimable_queued_task() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 1, TaskStatus::Queued);
        seed_snapshot(&store, 1, &["ralph:status:queued"]);
        let w = worker(store.clone());

        let control = ControlState::default();
        let claimed = w.claim_tick(&control, 1_000).await.unwrap();
        assert_eq!(claimed, 1);

        let task = store.get_task("acme/widgets", 1).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.daemon_id.as_deref(), Some("daemon-1"));
    }

    #[tokio::test]
    async fn claim_tick_skips_non_claimable_task() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 2, TaskStatus::Queued);
        seed_snapshot(&store, 2, &["ralph:status:queued", "ralph:status:blocked"]);
        let w = worker(store.clone());

        let claimed = w.claim_tick(&ControlState::default(), 1_000).await.unwrap();
        assert_eq!(claimed, 0);
    }

    #[test]
    fn heartbeat_tick_only_touches_owned_tasks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 3, TaskStatus::InProgress);
        store
            .patch_task(
                "acme/widgets",
                3,
                &TaskPatch {
                    daemon_id: Some(crate::store::models::Patch::Set("daemon-1".to_string())),
                    worker_id: Some(crate::store::models::Patch::Set("worker-1".to_string())),
                    heartbeat_at: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        let w = worker(store.clone());
        let updated = w.heartbeat_tick(5_000).unwrap();
        assert_eq!(updated, 1);
        let task = store.get_task("acme/widgets", 3).unwrap().unwrap();
        assert_eq!(task.heartbeat_at, Some(5_000));
    }

    #[tokio::test]
    async fn stale_recovery_resets_task_owned_by_dead_daemon() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 4, TaskStatus::InProgress);
        seed_snapshot(&store, 4, &["ralph:status:in-progress"]);
        store
            .patch_task(
                "acme/widgets",
                4,
                &TaskPatch {
                    daemon_id: Some(crate::store::models::Patch::Set("daemon-dead".to_string())),
                    heartbeat_at: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        let w = worker(store.clone());
        let recovered = w.stale_recovery_tick(1_000_000, |_| false).await.unwrap();
        assert_eq!(recovered, 1);
        let task = store.get_task("acme/widgets", 4).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.daemon_id, None);
    }

    #[tokio::test]
    async fn run_stage_pipeline_advances_through_every_stage_on_success() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 5, TaskStatus::InProgress);
        let w = worker(store.clone());
        let task = store.get_task("acme/widgets", 5).unwrap().unwrap();
        w.run_stage_pipeline(&task).await.unwrap();
        let after = store.get_task("acme/widgets", 5).unwrap().unwrap();
        assert_eq!(after.checkpoint.as_deref(), Some("build"));
        assert_eq!(after.checkpoint_seq, 2);
    }

    #[tokio::test]
    async fn context_exhausted_stage_compacts_and_resumes_instead_of_failing() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 6, TaskStatus::InProgress);
        let mut w = worker(store.clone());
        w.agent_runner = Arc::new(CompactsOnceRunner { calls: std::sync::atomic::AtomicUsize::new(0) });
        let task = store.get_task("acme/widgets", 6).unwrap().unwrap();

        w.run_stage_pipeline(&task).await.unwrap();

        let after = store.get_task("acme/widgets", 6).unwrap().unwrap();
        assert_eq!(after.checkpoint.as_deref(), Some("build"));
        assert_eq!(after.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn scenario_s5_guardrail_kill_records_exact_wire_shape_and_requeues() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_task(&store, 7, TaskStatus::InProgress);
        seed_snapshot(&store, 7, &["ralph:status:in-progress"]);
        let mut w = worker(store.clone());
        w.agent_runner = Arc::new(GuardrailKillsRunner { kind: GuardrailKind::WallTime });
        let task = store.get_task("acme/widgets", 7).unwrap().unwrap();

        let limits = GuardrailLimits::from_config(&w.config);
        let outcome = w.run_one_stage(&task, "plan", 0, &limits).await.unwrap();
        assert_eq!(outcome, StageOutcome::Retry);

        let run = store.get_run(1).unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(
            run.details_json.as_deref(),
            Some("{\"success\":false,\"guardrailTimeout\":{\"kind\":\"guardrail-timeout\",\"reason\":\"wall-time\"}}")
        );

        let after = store.get_task("acme/widgets", 7).unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Queued);
        assert_eq!(after.session_id, None);
        assert_eq!(after.watchdog_retries, 1);
    }
}
