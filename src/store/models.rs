//! Domain row types for the persistent store (§3, §4.A).
//!
//! Mirrors the teacher's `IssueRow -> Issue` pattern: SQLite gives us back plain
//! strings/integers, and a thin `FooRow` intermediate converts them into the typed
//! domain value the rest of the crate works with.

use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Logical status of a task, derived from the issue's label set (§4.D) and mirrored
/// into `tasks.status` for fast querying without re-deriving from GitHub on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Starting,
    InProgress,
    Throttled,
    Blocked,
    Escalated,
    Paused,
    InBot,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Starting => "starting",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Throttled => "throttled",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Paused => "paused",
            TaskStatus::InBot => "in-bot",
            TaskStatus::Done => "done",
        }
    }

    /// Precedence used by the queue driver to collapse a label set into one status:
    /// `done > in-bot > throttled > paused > blocked > escalated > in-progress > queued`.
    pub fn precedence(&self) -> u8 {
        match self {
            TaskStatus::Done => 8,
            TaskStatus::InBot => 7,
            TaskStatus::Throttled => 6,
            TaskStatus::Paused => 5,
            TaskStatus::Blocked => 4,
            TaskStatus::Escalated => 3,
            TaskStatus::InProgress => 2,
            TaskStatus::Starting => 1,
            TaskStatus::Queued => 0,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "starting" => Ok(TaskStatus::Starting),
            "in-progress" => Ok(TaskStatus::InProgress),
            "throttled" => Ok(TaskStatus::Throttled),
            "blocked" => Ok(TaskStatus::Blocked),
            "escalated" => Ok(TaskStatus::Escalated),
            "paused" => Ok(TaskStatus::Paused),
            "in-bot" => Ok(TaskStatus::InBot),
            "done" => Ok(TaskStatus::Done),
            other => Err(anyhow!("unknown task status: {other}")),
        }
    }
}

/// Why a task is blocked, per §3's `blockedSource` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockedSource {
    Deps,
    Auth,
    Ci,
    RateLimit,
    Guardrail,
    Unknown,
}

impl BlockedSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockedSource::Deps => "deps",
            BlockedSource::Auth => "auth",
            BlockedSource::Ci => "ci",
            BlockedSource::RateLimit => "rate-limit",
            BlockedSource::Guardrail => "guardrail",
            BlockedSource::Unknown => "unknown",
        }
    }
}

impl FromStr for BlockedSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deps" => Ok(BlockedSource::Deps),
            "auth" => Ok(BlockedSource::Auth),
            "ci" => Ok(BlockedSource::Ci),
            "rate-limit" => Ok(BlockedSource::RateLimit),
            "guardrail" => Ok(BlockedSource::Guardrail),
            "unknown" => Ok(BlockedSource::Unknown),
            other => Err(anyhow!("unknown blocked source: {other}")),
        }
    }
}

/// A logical unit of work keyed by `(repo, issue_number)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub repo: String,
    pub issue_number: i64,
    pub task_path: String,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub repo_slot: Option<i64>,
    pub daemon_id: Option<String>,
    pub heartbeat_at: Option<i64>,
    pub worktree_path: Option<String>,
    pub checkpoint: Option<String>,
    pub checkpoint_seq: i64,
    pub pause_requested: bool,
    pub paused_at_checkpoint: Option<String>,
    pub blocked_source: Option<BlockedSource>,
    pub resume_at: Option<i64>,
    pub watchdog_retries: i64,
}

/// Patch applied to a task row; `Some(None)` (via `Patch::Clear`) distinguishes an
/// explicit empty/absent value from "leave unchanged", per §4.D's note that explicit
/// empty strings in the patch must map to explicit empty strings in the row.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub session_id: Option<Patch<String>>,
    pub worker_id: Option<Patch<String>>,
    pub repo_slot: Option<Patch<i64>>,
    pub daemon_id: Option<Patch<String>>,
    pub heartbeat_at: Option<i64>,
    pub worktree_path: Option<Patch<String>>,
    pub checkpoint: Option<Patch<String>>,
    pub checkpoint_seq: Option<i64>,
    pub pause_requested: Option<bool>,
    pub paused_at_checkpoint: Option<Patch<String>>,
    pub blocked_source: Option<Patch<BlockedSource>>,
    pub resume_at: Option<Patch<i64>>,
    pub watchdog_retries: Option<i64>,
}

/// An explicit set-or-clear, as opposed to `Option`'s "absent means leave unchanged".
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Set(T),
    Clear,
}

impl<T: Clone> Patch<T> {
    fn apply(field: &mut Option<T>, patch: &Option<Patch<T>>) {
        match patch {
            None => {}
            Some(Patch::Clear) => *field = None,
            Some(Patch::Set(value)) => *field = Some(value.clone()),
        }
    }
}

/// Apply a [`TaskPatch`] to a task row in memory, honoring the `Some(None)`/absent
/// distinction: fields not named in the patch are left untouched (§4.D).
pub fn apply_task_patch(task: &Task, patch: &TaskPatch) -> Task {
    let mut next = task.clone();
    if let Some(status) = patch.status {
        next.status = status;
    }
    Patch::apply(&mut next.session_id, &patch.session_id);
    Patch::apply(&mut next.worker_id, &patch.worker_id);
    Patch::apply(&mut next.repo_slot, &patch.repo_slot);
    Patch::apply(&mut next.daemon_id, &patch.daemon_id);
    if let Some(heartbeat_at) = patch.heartbeat_at {
        next.heartbeat_at = Some(heartbeat_at);
    }
    Patch::apply(&mut next.worktree_path, &patch.worktree_path);
    Patch::apply(&mut next.checkpoint, &patch.checkpoint);
    if let Some(checkpoint_seq) = patch.checkpoint_seq {
        next.checkpoint_seq = checkpoint_seq;
    }
    if let Some(pause_requested) = patch.pause_requested {
        next.pause_requested = pause_requested;
    }
    Patch::apply(&mut next.paused_at_checkpoint, &patch.paused_at_checkpoint);
    Patch::apply(&mut next.blocked_source, &patch.blocked_source);
    Patch::apply(&mut next.resume_at, &patch.resume_at);
    if let Some(watchdog_retries) = patch.watchdog_retries {
        next.watchdog_retries = watchdog_retries;
    }
    next
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueSnapshot {
    pub repo: String,
    pub issue_number: i64,
    pub title: String,
    pub state: String,
    pub url: String,
    pub github_node_id: String,
    pub github_updated_at: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "open",
            PrState::Merged => "merged",
            PrState::Closed => "closed",
        }
    }
}

impl FromStr for PrState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PrState::Open),
            "merged" => Ok(PrState::Merged),
            "closed" => Ok(PrState::Closed),
            other => Err(anyhow!("unknown pr state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrSnapshot {
    pub repo: String,
    pub issue_number: i64,
    pub pr_url: String,
    pub state: PrState,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
    Throttled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Throttled => "throttled",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "failed" => Ok(RunOutcome::Failed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            "throttled" => Ok(RunOutcome::Throttled),
            other => Err(anyhow!("unknown run outcome: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub id: i64,
    pub repo: String,
    pub issue_number: i64,
    pub task_path: String,
    pub attempt_kind: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub outcome: Option<RunOutcome>,
    pub details_json: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateKind {
    Ci,
    Midpoint,
    Checks,
    Review,
}

impl GateKind {
    /// The fixed set of gates every run tracks (§4.F `ensureRalphRunGateRows`).
    pub const ALL: [GateKind; 4] = [GateKind::Ci, GateKind::Midpoint, GateKind::Checks, GateKind::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Ci => "ci",
            GateKind::Midpoint => "midpoint",
            GateKind::Checks => "checks",
            GateKind::Review => "review",
        }
    }
}

impl FromStr for GateKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ci" => Ok(GateKind::Ci),
            "midpoint" => Ok(GateKind::Midpoint),
            "checks" => Ok(GateKind::Checks),
            "review" => Ok(GateKind::Review),
            other => Err(anyhow!("unknown gate kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    Pending,
    Pass,
    Fail,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
        }
    }
}

impl FromStr for GateStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GateStatus::Pending),
            "pass" => Ok(GateStatus::Pass),
            "fail" => Ok(GateStatus::Fail),
            other => Err(anyhow!("unknown gate status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunGateResult {
    pub run_id: i64,
    pub gate: GateKind,
    pub status: GateStatus,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunGateArtifact {
    pub id: i64,
    pub run_id: i64,
    pub gate: GateKind,
    pub kind: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    Ok,
    Partial,
    Missing,
    TooLarge,
    Timeout,
    Error,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Ok => "ok",
            Quality::Partial => "partial",
            Quality::Missing => "missing",
            Quality::TooLarge => "too_large",
            Quality::Timeout => "timeout",
            Quality::Error => "error",
        }
    }
}

impl FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Quality::Ok),
            "partial" => Ok(Quality::Partial),
            "missing" => Ok(Quality::Missing),
            "too_large" => Ok(Quality::TooLarge),
            "timeout" => Ok(Quality::Timeout),
            "error" => Ok(Quality::Error),
            other => Err(anyhow!("unknown quality: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunMetrics {
    pub run_id: i64,
    pub wall_ms: Option<i64>,
    pub tool_ms: Option<i64>,
    pub anomaly_count: i64,
    pub recent_burst_at_end: bool,
    pub parse_error_count: i64,
    pub quality: Quality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStepMetrics {
    pub run_id: i64,
    pub step_title: String,
    pub wall_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollupBatchStatus {
    Open,
    Closed,
    RolledUp,
}

impl RollupBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupBatchStatus::Open => "open",
            RollupBatchStatus::Closed => "closed",
            RollupBatchStatus::RolledUp => "rolledUp",
        }
    }
}

impl FromStr for RollupBatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RollupBatchStatus::Open),
            "closed" => Ok(RollupBatchStatus::Closed),
            "rolledUp" => Ok(RollupBatchStatus::RolledUp),
            other => Err(anyhow!("unknown rollup batch status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupBatch {
    pub id: i64,
    pub repo: String,
    pub bot_branch: String,
    pub batch_size: i64,
    pub status: RollupBatchStatus,
    pub rollup_pr_url: Option<String>,
    pub rollup_pr_number: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollupBatchPr {
    pub batch_id: i64,
    pub pr_url: String,
    pub issue_refs_json: String,
    pub merged_at: String,
}

/// A bot-branch merge the in-bot reconciler observed but could not label
/// successfully; retried before the next cursor scan (§4.H).
#[derive(Debug, Clone, PartialEq)]
pub struct InBotPendingRow {
    pub id: i64,
    pub repo: String,
    pub issue_number: i64,
    pub pr_number: i64,
    pub merged_at: String,
    pub attempted_at: i64,
    pub attempt_error: Option<String>,
}

/// Outcome of the schema capability evaluator (§4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCapability {
    ReadableWritable,
    ReadableReadonlyForwardNewer,
    UnreadableForwardIncompatible,
}

pub fn evaluate_schema_capability(
    current_schema: i64,
    min_readable_schema: i64,
    max_readable_schema: i64,
    max_writable_schema: i64,
) -> SchemaCapability {
    if current_schema > max_readable_schema || current_schema < min_readable_schema {
        return SchemaCapability::UnreadableForwardIncompatible;
    }
    if current_schema > max_writable_schema {
        return SchemaCapability::ReadableReadonlyForwardNewer;
    }
    SchemaCapability::ReadableWritable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_precedence_orders_done_highest() {
        assert!(TaskStatus::Done.precedence() > TaskStatus::InBot.precedence());
        assert!(TaskStatus::InBot.precedence() > TaskStatus::Throttled.precedence());
        assert!(TaskStatus::Paused.precedence() > TaskStatus::Blocked.precedence());
        assert!(TaskStatus::Blocked.precedence() > TaskStatus::Escalated.precedence());
        assert!(TaskStatus::Escalated.precedence() > TaskStatus::InProgress.precedence());
        assert!(TaskStatus::InProgress.precedence() > TaskStatus::Queued.precedence());
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Starting,
            TaskStatus::InProgress,
            TaskStatus::Throttled,
            TaskStatus::Blocked,
            TaskStatus::Escalated,
            TaskStatus::Paused,
            TaskStatus::InBot,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn schema_capability_readable_writable_within_bounds() {
        assert_eq!(
            evaluate_schema_capability(3, 1, 5, 5),
            SchemaCapability::ReadableWritable
        );
    }

    #[test]
    fn schema_capability_readonly_when_newer_than_writable() {
        assert_eq!(
            evaluate_schema_capability(4, 1, 5, 3),
            SchemaCapability::ReadableReadonlyForwardNewer
        );
    }

    #[test]
    fn schema_capability_unreadable_when_beyond_max_readable() {
        assert_eq!(
            evaluate_schema_capability(9, 1, 5, 3),
            SchemaCapability::UnreadableForwardIncompatible
        );
    }

    #[test]
    fn schema_capability_unreadable_when_below_min_readable() {
        assert_eq!(
            evaluate_schema_capability(0, 1, 5, 5),
            SchemaCapability::UnreadableForwardIncompatible
        );
    }

    fn sample_task() -> Task {
        Task {
            repo: "acme/widgets".to_string(),
            issue_number: 1,
            task_path: "tasks/1.md".to_string(),
            status: TaskStatus::Queued,
            session_id: None,
            worker_id: None,
            repo_slot: None,
            daemon_id: None,
            heartbeat_at: None,
            worktree_path: None,
            checkpoint: None,
            checkpoint_seq: 0,
            pause_requested: false,
            paused_at_checkpoint: None,
            blocked_source: None,
            resume_at: None,
            watchdog_retries: 0,
        }
    }

    #[test]
    fn apply_task_patch_leaves_unnamed_fields_untouched() {
        let task = Task { session_id: Some("s1".to_string()), ..sample_task() };
        let patch = TaskPatch { status: Some(TaskStatus::InProgress), ..Default::default() };
        let next = apply_task_patch(&task, &patch);
        assert_eq!(next.status, TaskStatus::InProgress);
        assert_eq!(next.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn apply_task_patch_clear_distinguishes_from_absent() {
        let task = Task { worker_id: Some("w1".to_string()), ..sample_task() };
        let patch = TaskPatch { worker_id: Some(Patch::Clear), ..Default::default() };
        let next = apply_task_patch(&task, &patch);
        assert_eq!(next.worker_id, None);
    }

    #[test]
    fn apply_task_patch_set_replaces_value() {
        let task = sample_task();
        let patch = TaskPatch { worker_id: Some(Patch::Set("w2".to_string())), ..Default::default() };
        let next = apply_task_patch(&task, &patch);
        assert_eq!(next.worker_id.as_deref(), Some("w2"));
    }

    #[test]
    fn apply_task_patch_recovers_stale_claim_by_clearing_operational_fields() {
        let task = Task {
            status: TaskStatus::InProgress,
            session_id: Some("s1".to_string()),
            worker_id: Some("w1".to_string()),
            daemon_id: Some("d1".to_string()),
            heartbeat_at: Some(1000),
            ..sample_task()
        };
        let patch = TaskPatch {
            status: Some(TaskStatus::Queued),
            session_id: Some(Patch::Clear),
            worker_id: Some(Patch::Clear),
            daemon_id: Some(Patch::Clear),
            ..Default::default()
        };
        let next = apply_task_patch(&task, &patch);
        assert_eq!(next.status, TaskStatus::Queued);
        assert_eq!(next.session_id, None);
        assert_eq!(next.worker_id, None);
        assert_eq!(next.daemon_id, None);
        assert_eq!(next.heartbeat_at, Some(1000));
    }
}
