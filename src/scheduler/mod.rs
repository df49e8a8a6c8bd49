//! Worker scheduler (§4.G): claims queued tasks, drives the stage pipeline, applies
//! guardrails, and recovers stale claims. One [`Worker`] instance owns a set of
//! concurrent slots for a single repo; the binary hosts up to `max_workers` of them,
//! per [`crate::config::RalphConfig::max_workers`].
//!
//! Pure decision logic (who is claimable, who is stale, what patch to apply) lives
//! in this module as plain functions over [`crate::store::Task`] so it can be unit
//! tested without a database or subprocess; [`agent`] holds the one place that
//! actually spawns the external agent, grounded on the teacher's
//! `orchestrator::ClaudeRunner` subprocess-streaming idiom.

pub mod agent;
pub mod classify;
pub mod compaction;
pub mod guardrail;
pub mod stage;
pub mod worker;

use crate::daemon::{ControlMode, ControlState};
use crate::store::{BlockedSource, Patch, Task, TaskPatch, TaskStatus};

/// A task eligible to be claimed this tick, paired with its current GitHub labels
/// (the queue driver's [`crate::queue::is_claimable`] needs the label set, not just
/// the cached status).
#[derive(Debug, Clone)]
pub struct ClaimCandidate {
    pub task: Task,
    pub labels: Vec<String>,
}

/// One claim decision: the label delta to apply on GitHub and the task-row patch to
/// write locally, applied together as the worker's `tryClaimTask` (§4.G).
#[derive(Debug, Clone)]
pub struct ClaimPlan {
    pub repo: String,
    pub issue_number: i64,
    pub label_delta: crate::queue::LabelDelta,
    pub patch: TaskPatch,
}

/// Whether the global control state currently accepts new claims (§4.G, §5):
/// `draining` and `paused` both refuse new work; only `running` claims.
pub fn accepts_new_claims(control: &ControlState) -> bool {
    control.mode == ControlMode::Running
}

/// Build the claim plan for one candidate: `+in-progress/-queued` label delta plus
/// the operational-field patch the worker writes in the same step (§4.D, §4.G).
pub fn plan_claim(
    candidate: &ClaimCandidate,
    daemon_id: &str,
    worker_id: &str,
    repo_slot: i64,
    now_ms: i64,
) -> Option<ClaimPlan> {
    if !crate::queue::is_claimable(&candidate.labels) {
        return None;
    }
    let label_delta = crate::queue::claim_delta(&candidate.labels);
    let patch = TaskPatch {
        status: Some(TaskStatus::InProgress),
        daemon_id: Some(Patch::Set(daemon_id.to_string())),
        worker_id: Some(Patch::Set(worker_id.to_string())),
        repo_slot: Some(Patch::Set(repo_slot)),
        heartbeat_at: Some(now_ms),
        session_id: Some(Patch::Set(String::new())),
        ..Default::default()
    };
    Some(ClaimPlan {
        repo: candidate.task.repo.clone(),
        issue_number: candidate.task.issue_number,
        label_delta,
        patch,
    })
}

/// Select claim plans for this tick, respecting the per-repo concurrency budget.
/// `already_running` counts slots currently occupied for the repo; claims stop once
/// `already_running + newly_claimed == max_slots`.
pub fn plan_claims_for_tick(
    candidates: &[ClaimCandidate],
    control: &ControlState,
    daemon_id: &str,
    worker_id: &str,
    already_running: usize,
    max_slots: usize,
    now_ms: i64,
) -> Vec<ClaimPlan> {
    if !accepts_new_claims(control) {
        return Vec::new();
    }
    let mut plans = Vec::new();
    let mut occupied = already_running;
    for (i, candidate) in candidates.iter().enumerate() {
        if occupied >= max_slots {
            break;
        }
        if let Some(plan) = plan_claim(candidate, daemon_id, worker_id, i as i64, now_ms) {
            occupied += 1;
            plans.push(plan);
        }
    }
    plans
}

/// A task is stale iff it is `in-progress`, its heartbeat is older than `stale_ttl`,
/// and its owning daemon is either a different daemon or no longer alive (§4.G).
pub fn is_stale(
    task: &Task,
    now_ms: i64,
    stale_ttl_ms: i64,
    this_daemon_id: &str,
    owner_is_alive: impl FnOnce(&str) -> bool,
) -> bool {
    if task.status != TaskStatus::InProgress {
        return false;
    }
    let Some(heartbeat_at) = task.heartbeat_at else {
        return true;
    };
    if now_ms - heartbeat_at <= stale_ttl_ms {
        return false;
    }
    match &task.daemon_id {
        Some(owner) if owner == this_daemon_id => false,
        Some(owner) => !owner_is_alive(owner),
        None => true,
    }
}

/// The patch that recovers a stale claim: back to `queued`, every operational field
/// cleared (§4.G, §8 invariant 2).
pub fn recover_stale_patch() -> TaskPatch {
    TaskPatch {
        status: Some(TaskStatus::Queued),
        session_id: Some(Patch::Clear),
        worker_id: Some(Patch::Clear),
        repo_slot: Some(Patch::Clear),
        daemon_id: Some(Patch::Clear),
        worktree_path: Some(Patch::Clear),
        checkpoint: Some(Patch::Clear),
        pause_requested: Some(false),
        paused_at_checkpoint: Some(Patch::Clear),
        ..Default::default()
    }
}

/// The patch a worker applies on every heartbeat tick for its own in-progress
/// tasks (§4.G).
pub fn heartbeat_patch(now_ms: i64) -> TaskPatch {
    TaskPatch {
        heartbeat_at: Some(now_ms),
        ..Default::default()
    }
}

/// Terminal-state patch for a task whose stage failed with a classified outcome
/// (§4.G "Error classification"). `blocked`/`throttled`/`escalated` all clear the
/// session but keep the worktree/checkpoint so the next attempt can resume context.
pub fn terminal_patch(
    outcome: classify::FailureClass,
    resume_at_ms: Option<i64>,
) -> TaskPatch {
    match outcome {
        classify::FailureClass::NonRetriableAuth => TaskPatch {
            status: Some(TaskStatus::Blocked),
            blocked_source: Some(Patch::Set(BlockedSource::Auth)),
            session_id: Some(Patch::Clear),
            ..Default::default()
        },
        classify::FailureClass::RateLimit => TaskPatch {
            status: Some(TaskStatus::Throttled),
            resume_at: resume_at_ms.map(Patch::Set),
            session_id: Some(Patch::Clear),
            ..Default::default()
        },
        classify::FailureClass::Transient => TaskPatch {
            status: Some(TaskStatus::Queued),
            session_id: Some(Patch::Clear),
            ..Default::default()
        },
        classify::FailureClass::Unknown => TaskPatch {
            status: Some(TaskStatus::Escalated),
            session_id: Some(Patch::Clear),
            ..Default::default()
        },
    }
}

/// Patch applied when a guardrail hard-kills an invocation: back to `queued` (or
/// `throttled` if the classifier deemed the timeout itself transient-rate-limit
/// adjacent — callers decide which by passing the right `status`), watchdog
/// retries incremented (§4.G).
pub fn guardrail_kill_patch(status: TaskStatus, watchdog_retries: i64) -> TaskPatch {
    TaskPatch {
        status: Some(status),
        session_id: Some(Patch::Clear),
        watchdog_retries: Some(watchdog_retries + 1),
        ..Default::default()
    }
}
