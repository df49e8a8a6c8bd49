//! Done reconciler (§4.H): watches merges to a repo's base branch. For every
//! closing-issues reference on a just-merged PR, projects the issue to `done` and
//! clears the task's operational fields, then advances `(lastMergedAt,
//! lastPrNumber)` — monotonically, and only after every issue that window named
//! has been attempted (§8 invariant 4).

use std::sync::Arc;

use crate::errors::ReconcileError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::github::ops;
use crate::queue;
use crate::reconcile::ReconcileSummary;
use crate::store::models::TaskStatus;
use crate::store::{Store, cursors, idempotency};

pub struct DoneReconciler {
    pub store: Arc<Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub repo: String,
    pub base_branch: String,
}

impl DoneReconciler {
    pub async fn tick(&self) -> Result<ReconcileSummary, ReconcileError> {
        let cursor = {
            let conn = self.store.conn();
            cursors::get_done_reconcile(&conn, &self.repo)?
        };
        let since = cursor
            .last_merged_at
            .clone()
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

        let merged = ops::list_merged_prs_since(self.transport.as_ref(), &self.repo, &self.base_branch, &since)
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;

        let mut summary = ReconcileSummary::default();
        let mut next_cursor = cursor.clone();

        for pr in &merged {
            for issue_number in ops::closing_issue_numbers(&pr.body) {
                let key = format!("done-reconcile:{}#{issue_number}:pr{}", self.repo, pr.number);
                let claimed = {
                    let conn = self.store.conn();
                    idempotency::claim(&conn, &key, "done-reconcile")?
                };
                if !claimed {
                    continue;
                }
                match self.close_issue(issue_number).await {
                    Ok(()) => summary.updated += 1,
                    Err(err) => {
                        summary.errors += 1;
                        let conn = self.store.conn();
                        let _ = idempotency::delete(&conn, &key);
                        tracing::warn!(
                            repo = %self.repo, issue = issue_number, pr = pr.number, error = %err,
                            "done reconcile failed for issue",
                        );
                    }
                }
            }
            next_cursor.last_merged_at = Some(pr.merged_at.clone());
            next_cursor.last_pr_number = Some(pr.number);
        }

        if next_cursor != cursor {
            let conn = self.store.conn();
            cursors::set_done_reconcile(&conn, &self.repo, &next_cursor)?;
        }
        Ok(summary)
    }

    async fn close_issue(&self, issue_number: i64) -> Result<(), ReconcileError> {
        let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? else {
            // Nothing cached to project a label delta against; the next issue-sync
            // tick will pick this issue up and a later done-reconcile pass catches it.
            return Ok(());
        };

        let delta = queue::status_delta(&snapshot.labels, TaskStatus::Done);
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

        self.store
            .clear_task_operational_fields(&self.repo, issue_number, TaskStatus::Done)?;
        Ok(())
    }
}
