//! Stage pipeline mechanics (§4.G): the ordered `[plan, build, verify, gate, pr]`
//! list is data, not code — this module turns that list plus a task's current
//! checkpoint into "what runs next", builds the idempotency keys checkpoints and
//! cache-busted invocations need, and computes the pause-wait backoff the claim
//! loop sleeps on while an operator-requested pause is outstanding.

use std::time::Duration;

use rand::Rng;

use crate::daemon::ControlState;
use crate::errors::SchedulerError;

/// Validate a configured stage list: non-empty, no duplicate names. Returns the
/// list unchanged so callers can chain it straight into a pipeline.
pub fn validate_pipeline(stages: &[String]) -> Result<(), SchedulerError> {
    if stages.is_empty() {
        return Err(SchedulerError::Other(anyhow::anyhow!("stage pipeline must not be empty")));
    }
    for (i, stage) in stages.iter().enumerate() {
        if stages[..i].contains(stage) {
            return Err(SchedulerError::UnknownStage {
                stage: stage.clone(),
                dependency: stage.clone(),
            });
        }
    }
    Ok(())
}

/// Where to resume a task whose `checkpoint` names the last stage it completed (or
/// paused within). `None` checkpoint means start from the first stage. An unknown
/// checkpoint name means the configured pipeline changed underneath a paused task.
pub fn resume_index(stages: &[String], checkpoint: Option<&str>) -> Result<usize, SchedulerError> {
    match checkpoint {
        None => Ok(0),
        Some(cp) => stages
            .iter()
            .position(|s| s == cp)
            .map(|i| i + 1)
            .ok_or_else(|| SchedulerError::UnknownStage {
                stage: cp.to_string(),
                dependency: stages.first().cloned().unwrap_or_default(),
            }),
    }
}

/// The idempotency ledger key for a checkpoint event: unique per
/// `(task, checkpoint, checkpointSeq)` (§4.G "emits a checkpoint event exactly once").
pub fn checkpoint_key(repo: &str, issue_number: i64, checkpoint: &str, checkpoint_seq: i64) -> String {
    format!("checkpoint:{repo}#{issue_number}:{checkpoint}:{checkpoint_seq}")
}

/// The cache-bust key passed to the agent for one stage invocation, so identical
/// prompts across retries don't hit a stale response cache (§4.G "stepKey").
pub fn step_key(task_path: &str, stage: &str, checkpoint_seq: i64) -> String {
    format!("{task_path}:{stage}:{checkpoint_seq}")
}

/// Whether the worker must pause before running the next stage, per the control
/// state and the task's already-recorded pause checkpoint. Mirrors §4.G's rule:
/// pausing with no checkpoint pins pauses at the very next boundary; pausing with a
/// specific checkpoint only fires when that exact checkpoint is reached.
pub fn should_pause_at(control: &ControlState, next_checkpoint: &str) -> bool {
    if control.pause_requested != Some(true) {
        return false;
    }
    match &control.pause_at_checkpoint {
        None => true,
        Some(cp) => cp == next_checkpoint,
    }
}

/// Exponential pause-wait backoff in `[250ms, 2s]` plus jitter up to 125ms
/// (§4.G). `attempt` is 0-indexed (first wait uses `attempt = 0`).
pub fn pause_wait_backoff(attempt: u32) -> Duration {
    let base_ms: u64 = 250u64.saturating_mul(1u64 << attempt.min(4));
    let capped_ms = base_ms.min(2_000);
    let jitter_ms = rand::rng().random_range(0..=125u64);
    Duration::from_millis(capped_ms + jitter_ms)
}
