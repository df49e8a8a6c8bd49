//! Queue driver (§4.D): projects GitHub label state into a logical task status,
//! enforces the single-status-label invariant, and computes claim/workflow-label
//! deltas. This module is pure — it never talks to GitHub or the store directly;
//! the scheduler applies the deltas it computes through [`crate::github`].

use crate::github::labels::LabelSpec;
use crate::store::{BlockedSource, TaskStatus};

/// Prefix every status label carries on GitHub.
pub const STATUS_PREFIX: &str = "ralph:status:";

fn status_label(status: TaskStatus) -> String {
    format!("{STATUS_PREFIX}{}", status.as_str())
}

fn label_to_status(label: &str) -> Option<TaskStatus> {
    label.strip_prefix(STATUS_PREFIX)?.parse().ok()
}

/// The canonical workflow labels ralph creates/converges per repo (§4.D, §6).
pub fn canonical_labels() -> Vec<LabelSpec> {
    let status = [
        (TaskStatus::Queued, "0366d6", "Ready to be claimed by a worker"),
        (TaskStatus::InProgress, "fbca04", "A worker is actively running an agent"),
        (TaskStatus::Blocked, "d73a4a", "Blocked on a dependency or operator action"),
        (TaskStatus::Paused, "6a737d", "Paused by operator request"),
        (TaskStatus::Throttled, "f9a825", "Waiting out a rate limit"),
        (TaskStatus::InBot, "0e8a16", "Merged into the bot integration branch"),
        (TaskStatus::Done, "1a7f37", "Merged into the base branch"),
    ];
    let mut labels: Vec<LabelSpec> = status
        .iter()
        .map(|(s, color, desc)| LabelSpec {
            name: status_label(*s),
            color: (*color).to_string(),
            description: (*desc).to_string(),
        })
        .collect();
    for (name, color, desc) in [
        ("ralph:cmd:queue", "ededed", "Operator request: (re)queue this issue"),
        ("ralph:cmd:pause", "ededed", "Operator request: pause this issue's worker"),
        ("ralph:cmd:stop", "ededed", "Operator request: stop this issue's worker"),
        ("ralph:cmd:satisfy", "ededed", "Operator request: mark dependencies satisfied"),
    ] {
        labels.push(LabelSpec {
            name: name.to_string(),
            color: color.to_string(),
            description: desc.to_string(),
        });
    }
    labels
}

/// Project an issue's label set to a logical status with deterministic precedence:
/// `done > in-bot > throttled > paused > blocked > escalated > in-progress > queued`.
/// `escalated` has no GitHub label of its own (§9); it is tracked only in the task
/// row, so it never wins this projection — the caller folds it in separately when
/// reconciling label-derived status against the stored task row.
pub fn derive_status(labels: &[String]) -> Option<TaskStatus> {
    labels
        .iter()
        .filter_map(|l| label_to_status(l))
        .max_by_key(|s| s.precedence())
}

/// How many status-prefixed labels an issue currently carries, and which.
fn status_labels(labels: &[String]) -> Vec<&String> {
    labels.iter().filter(|l| l.starts_with(STATUS_PREFIX)).collect()
}

/// A label mutation: labels to add, labels to remove. Non-status labels are never
/// touched by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelDelta {
    fn to_status(target: TaskStatus, current: &[String]) -> Self {
        let want = status_label(target);
        let remove: Vec<String> = status_labels(current)
            .into_iter()
            .filter(|l| **l != want)
            .cloned()
            .collect();
        let add = if current.iter().any(|l| *l == want) {
            Vec::new()
        } else {
            vec![want]
        };
        LabelDelta { add, remove }
    }
}

/// Compute the status delta to transition an issue to `target`, removing every
/// other status-prefixed label (§4.D single-status-label invariant).
pub fn status_delta(current_labels: &[String], target: TaskStatus) -> LabelDelta {
    LabelDelta::to_status(target, current_labels)
}

/// A healing pass is owed when an issue carries zero or more than one status label.
/// Picks `desired_hint` unless dependency-blocked, in which case `queued` always
/// wins — the `blocked` label itself is added by the relationship engine, not here.
pub fn heal_status(
    current_labels: &[String],
    desired_hint: Option<TaskStatus>,
    dependency_blocked: bool,
) -> Option<LabelDelta> {
    let carried = status_labels(current_labels);
    if carried.len() == 1 {
        return None;
    }
    let target = if dependency_blocked {
        TaskStatus::Queued
    } else {
        desired_hint.unwrap_or(TaskStatus::Queued)
    };
    Some(status_delta(current_labels, target))
}

/// An issue is claimable iff it carries `queued` and none of the other
/// claim-blocking statuses (§4.D).
pub fn is_claimable(labels: &[String]) -> bool {
    let has_queued = labels.iter().any(|l| l == &status_label(TaskStatus::Queued));
    if !has_queued {
        return false;
    }
    let blocking = [
        TaskStatus::InProgress,
        TaskStatus::Blocked,
        TaskStatus::Paused,
        TaskStatus::Throttled,
        TaskStatus::InBot,
        TaskStatus::Done,
    ];
    !blocking.iter().any(|s| labels.iter().any(|l| l == &status_label(*s)))
}

/// The label delta performed when a worker claims an issue: `+in-progress, -queued`,
/// applied atomically from the issue's perspective (§4.D).
pub fn claim_delta(current_labels: &[String]) -> LabelDelta {
    status_delta(current_labels, TaskStatus::InProgress)
}

/// Sanity check used by callers that apply a delta then re-read the resulting
/// label set: after applying, exactly one status label (or zero, for `escalated`,
/// which has none) should remain.
pub fn apply_delta(current_labels: &[String], delta: &LabelDelta) -> Vec<String> {
    let mut next: Vec<String> = current_labels
        .iter()
        .filter(|l| !delta.remove.contains(l))
        .cloned()
        .collect();
    for add in &delta.add {
        if !next.contains(add) {
            next.push(add.clone());
        }
    }
    next
}

/// `blocked_source` derived from a GitHub error classification, for tasks that
/// transition to `blocked` (§3).
pub fn blocked_source_for_status(status: TaskStatus) -> Option<BlockedSource> {
    match status {
        TaskStatus::Blocked => Some(BlockedSource::Deps),
        _ => None,
    }
}
