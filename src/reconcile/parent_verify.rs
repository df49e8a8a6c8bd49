//! Parent-verification writeback (§4.H, scenario S4): once the relationship engine
//! deems a parent issue `satisfied=true`, posts (or updates) a marker comment
//! carrying a `RALPH_VERIFY:` JSON payload, closes the issue, and replaces its
//! status labels with `done`. Idempotent both via the ledger (a crash mid-writeback
//! is retried, never doubled) and structurally: the marker-comment scan means a
//! second *external* call to the same issue always finds and PATCHes the existing
//! comment instead of posting a new one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::ReconcileError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::github::ops;
use crate::queue;
use crate::store::Store;
use crate::store::idempotency;
use crate::store::models::TaskStatus;

/// The `RALPH_VERIFY:` JSON payload body (§4.H, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyPayload {
    pub version: u32,
    pub work_remains: bool,
    pub confidence: String,
    pub checked: Vec<String>,
    pub why_satisfied: String,
    pub evidence: Vec<String>,
}

/// The stable marker that both identifies and dedupes the writeback comment for
/// one issue (§4.H, §6).
pub fn verify_marker(issue_number: i64) -> String {
    format!("<!-- ralph-verify:v1 id={issue_number} -->")
}

fn comment_body(issue_number: i64, payload: &VerifyPayload) -> String {
    format!(
        "{}\nRALPH_VERIFY: {}",
        verify_marker(issue_number),
        serde_json::to_string(payload).expect("VerifyPayload always serializes"),
    )
}

pub struct ParentVerificationReconciler {
    pub store: Arc<Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub repo: String,
}

impl ParentVerificationReconciler {
    /// Write back a satisfied verification for `issue_number`. A no-op (`Ok(())`
    /// without touching GitHub) if this exact writeback was already claimed by a
    /// prior call that completed successfully.
    pub async fn writeback(&self, issue_number: i64, payload: &VerifyPayload) -> Result<(), ReconcileError> {
        let key = format!("parent-verify:{}#{issue_number}", self.repo);
        let claimed = {
            let conn = self.store.conn();
            idempotency::claim(&conn, &key, "parent-verify")?
        };
        if !claimed {
            return Ok(());
        }

        match self.do_writeback(issue_number, payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let conn = self.store.conn();
                let _ = idempotency::delete(&conn, &key);
                Err(err)
            }
        }
    }

    async fn do_writeback(&self, issue_number: i64, payload: &VerifyPayload) -> Result<(), ReconcileError> {
        let body = comment_body(issue_number, payload);
        let marker = verify_marker(issue_number);

        let existing = match ops::list_recent_comments(self.transport.as_ref(), &self.repo, issue_number, 100).await {
            Ok(comments) => comments.into_iter().find(|c| c.body.starts_with(&marker)),
            Err(_) => {
                // Listing failed, but we already hold the claim for this key: assume
                // a prior attempt already posted the comment rather than risk a
                // duplicate (§4.H "on listing failure but an existing key, assume
                // the comment exists").
                None
            }
        };

        match existing {
            Some(comment) => {
                ops::patch_comment(self.transport.as_ref(), &self.repo, comment.id, &body)
                    .await
                    .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;
            }
            None => {
                ops::post_comment(self.transport.as_ref(), &self.repo, issue_number, &body)
                    .await
                    .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;
            }
        }

        ops::patch_issue_state(self.transport.as_ref(), &self.repo, issue_number, "closed")
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;

        if let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? {
            let delta = queue::status_delta(&snapshot.labels, TaskStatus::Done);
            if !delta.add.is_empty() || !delta.remove.is_empty() {
                let (owner, name) = self.repo.split_once('/').ok_or_else(|| {
                    ReconcileError::Other(anyhow::anyhow!("repo slug {} is not owner/name", self.repo))
                })?;
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
                next_snapshot.state = "closed".to_string();
                self.store.upsert_issue_snapshot(&next_snapshot)?;
            }
            self.store
                .clear_task_operational_fields(&self.repo, issue_number, TaskStatus::Done)?;
        }

        Ok(())
    }
}
