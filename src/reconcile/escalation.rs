//! Escalation-resolution reconciler (§4.H): watches `escalated` tasks for an
//! operator comment that resolves them. Conditionally fetches comments (only when
//! the dwell-time budget or a newer `githubUpdatedAt` justifies a round trip),
//! scans newest-first for `RALPH RESOLVED:` or `RALPH APPROVE` from an authorized
//! operator, and transitions the task back to `queued`.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::ReconcileError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::github::ops::{self, Comment};
use crate::queue;
use crate::reconcile::ReconcileSummary;
use crate::store::cursors::EscalationCommentCheckState;
use crate::store::models::TaskStatus;
use crate::store::{Store, cursors};

/// Minimum dwell time between comment fetches for a given escalated issue, absent
/// a newer `githubUpdatedAt` (§4.H, §9 "fixed centrally").
pub const MIN_RECHECK_INTERVAL_MS: i64 = 5 * 60 * 1000;

const AUTHORIZED_ASSOCIATIONS: [&str; 3] = ["OWNER", "MEMBER", "COLLABORATOR"];

static RESOLVED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^RALPH RESOLVED:\s*(.+)$").unwrap());
static APPROVE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?mi)^RALPH APPROVE\s*$").unwrap());
static CONSULTANT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--\s*ralph-consultant:v1\s*-->").unwrap());

/// `false` iff the recheck window hasn't elapsed *and* the issue hasn't been
/// updated since the last check (§8 boundary behavior). Either condition alone is
/// enough to justify a fetch.
pub fn should_fetch_escalation_comments(
    now_ms: i64,
    min_interval_ms: i64,
    state: &EscalationCommentCheckState,
    github_updated_at: &str,
) -> bool {
    let interval_not_elapsed = state
        .last_checked_at
        .is_some_and(|last| now_ms - last < min_interval_ms);
    let not_updated = state
        .last_seen_updated_at
        .as_deref()
        .is_some_and(|seen| github_updated_at <= seen);
    !(interval_not_elapsed && not_updated)
}

fn is_authorized(comment: &Comment) -> bool {
    AUTHORIZED_ASSOCIATIONS.contains(&comment.author_association.as_str())
}

fn resolved_text(body: &str) -> Option<String> {
    RESOLVED_RE.captures(body).map(|c| c[1].trim().to_string())
}

fn is_approve(body: &str) -> bool {
    APPROVE_RE.is_match(body)
}

/// The most recent `<!-- ralph-consultant:v1 -->`-marked comment's
/// `proposed_resolution_text`, scanning newest-first (the same order the comment
/// list already arrives in).
fn find_consultant_proposal(comments: &[Comment]) -> Option<String> {
    for comment in comments {
        if !CONSULTANT_MARKER_RE.is_match(&comment.body) {
            continue;
        }
        let json_src = crate::util::extract_json_object(&comment.body)?;
        let parsed: serde_json::Value = serde_json::from_str(&json_src).ok()?;
        if let Some(text) = parsed.get("proposed_resolution_text").and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
    }
    None
}

pub struct EscalationReconciler {
    pub store: Arc<Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub repo: String,
}

impl EscalationReconciler {
    pub async fn tick(&self) -> Result<ReconcileSummary, ReconcileError> {
        let escalated: Vec<_> = self
            .store
            .list_tasks_by_status(TaskStatus::Escalated)?
            .into_iter()
            .filter(|t| t.repo == self.repo)
            .collect();

        let mut summary = ReconcileSummary::default();
        for task in escalated {
            match self.process_issue(task.issue_number).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => {}
                Err(err) => {
                    summary.errors += 1;
                    tracing::warn!(
                        repo = %self.repo, issue = task.issue_number, error = %err,
                        "escalation reconcile failed for issue",
                    );
                }
            }
        }
        Ok(summary)
    }

    async fn process_issue(&self, issue_number: i64) -> Result<bool, ReconcileError> {
        let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? else {
            return Ok(false);
        };
        let now_ms = crate::util::now_unix_ms();
        let state = {
            let conn = self.store.conn();
            cursors::get_escalation_comment_check_state(&conn, &self.repo)?
        };

        if !should_fetch_escalation_comments(now_ms, MIN_RECHECK_INTERVAL_MS, &state, &snapshot.github_updated_at) {
            return Ok(false);
        }

        let comments = ops::list_recent_comments(self.transport.as_ref(), &self.repo, issue_number, 100)
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;

        let mut next_state = state.clone();
        next_state.last_checked_at = Some(now_ms);
        next_state.last_seen_updated_at = Some(snapshot.github_updated_at.clone());

        let mut resolution: Option<(Comment, String, bool)> = None;
        for comment in &comments {
            if !is_authorized(comment) {
                continue;
            }
            if let Some(text) = resolved_text(&comment.body) {
                resolution = Some((comment.clone(), text, false));
                break;
            }
            if is_approve(&comment.body) {
                if let Some(text) = find_consultant_proposal(&comments) {
                    resolution = Some((comment.clone(), text, true));
                    break;
                }
            }
        }

        let Some((comment, resolution_text, needs_translation)) = resolution else {
            let conn = self.store.conn();
            cursors::set_escalation_comment_check_state(&conn, &self.repo, &next_state)?;
            return Ok(false);
        };

        if state.last_resolved_comment_id == Some(comment.id) {
            let conn = self.store.conn();
            cursors::set_escalation_comment_check_state(&conn, &self.repo, &next_state)?;
            return Ok(false);
        }

        if needs_translation {
            ops::post_comment(
                self.transport.as_ref(),
                &self.repo,
                issue_number,
                &format!("RALPH RESOLVED: {resolution_text}"),
            )
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;
        }

        let delta = queue::status_delta(&snapshot.labels, TaskStatus::Queued);
        if !delta.add.is_empty() || !delta.remove.is_empty() {
            let (owner, name) = self
                .repo
                .split_once('/')
                .ok_or_else(|| ReconcileError::Other(anyhow::anyhow!("repo slug {} is not owner/name", self.repo)))?;
            mutate_issue_labels(
                self.transport.as_ref(),
                &self.label_cache,
                owner,
                name,
                &snapshot.github_node_id,
                &delta,
            )
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;

            let mut next_snapshot = snapshot.clone();
            next_snapshot.labels = queue::apply_delta(&snapshot.labels, &delta);
            self.store.upsert_issue_snapshot(&next_snapshot)?;
        }

        self.store.patch_task(
            &self.repo,
            issue_number,
            &crate::store::models::TaskPatch {
                status: Some(TaskStatus::Queued),
                blocked_source: Some(crate::store::models::Patch::Clear),
                ..Default::default()
            },
        )?;

        next_state.last_resolved_comment_id = Some(comment.id);
        next_state.last_resolved_comment_at = Some(comment.created_at.clone());
        let conn = self.store.conn();
        cursors::set_escalation_comment_check_state(&conn, &self.repo, &next_state)?;
        Ok(true)
    }
}
