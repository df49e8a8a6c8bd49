//! In-bot reconciler (§4.H, scenario S3): watches merges to a repo's *bot
//! integration* branch. Bot-branch PRs merge far more often than base-branch
//! rollups, so a label-write failure here must not block the cursor — the issue is
//! enqueued as a pending row and retried first on the next tick, while the cursor
//! still advances past the PR that produced it.

use std::sync::Arc;

use crate::errors::ReconcileError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::github::ops;
use crate::queue;
use crate::reconcile::ReconcileSummary;
use crate::store::cursors::InBotReconcileCursor;
use crate::store::models::TaskStatus;
use crate::store::{Store, cursors, idempotency};

pub struct InBotReconciler {
    pub store: Arc<Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub repo: String,
    pub bot_branch: String,
}

impl InBotReconciler {
    pub async fn tick(&self) -> Result<ReconcileSummary, ReconcileError> {
        let mut cursor = {
            let conn = self.store.conn();
            cursors::get_in_bot_reconcile(&conn, &self.repo)?
        };

        let is_first_run = cursor.last_merged_at.is_none() && cursor.bot_branch.is_none();
        let branch_changed = cursor
            .bot_branch
            .as_deref()
            .is_some_and(|b| b != self.bot_branch);

        if is_first_run {
            // Avoid a historical stampede: start from now, not from the dawn of the repo.
            cursor = InBotReconcileCursor {
                bot_branch: Some(self.bot_branch.clone()),
                last_merged_at: Some(crate::util::now_unix_ms_as_iso()),
                last_pr_number: None,
            };
            let conn = self.store.conn();
            cursors::set_in_bot_reconcile(&conn, &self.repo, &cursor)?;
            return Ok(ReconcileSummary::default());
        }

        if branch_changed {
            cursor = InBotReconcileCursor {
                bot_branch: Some(self.bot_branch.clone()),
                last_merged_at: Some(crate::util::now_unix_ms_as_iso()),
                last_pr_number: None,
            };
            let conn = self.store.conn();
            cursors::set_in_bot_reconcile(&conn, &self.repo, &cursor)?;
            self.store.clear_in_bot_pending(&self.repo)?;
            return Ok(ReconcileSummary::default());
        }

        let mut summary = ReconcileSummary::default();

        // Pending rows retry before anything else (§4.H: "the next tick retries
        // pending rows first").
        for pending in self.store.list_in_bot_pending(&self.repo)? {
            match self.apply_in_bot(pending.issue_number).await {
                Ok(()) => {
                    self.store.delete_in_bot_pending(pending.id)?;
                    summary.updated += 1;
                }
                Err(err) => {
                    summary.pending += 1;
                    tracing::debug!(
                        repo = %self.repo, issue = pending.issue_number, error = %err,
                        "in-bot pending row retry still failing",
                    );
                }
            }
        }

        let since = cursor.last_merged_at.clone().unwrap_or_default();
        let merged = ops::list_merged_prs_since(self.transport.as_ref(), &self.repo, &self.bot_branch, &since)
            .await
            .map_err(|e| ReconcileError::Other(anyhow::anyhow!(e.message)))?;

        let mut next_cursor = cursor.clone();
        for pr in &merged {
            for issue_number in ops::closing_issue_numbers(&pr.body) {
                let key = format!("in-bot-reconcile:{}#{issue_number}:pr{}", self.repo, pr.number);
                let claimed = {
                    let conn = self.store.conn();
                    idempotency::claim(&conn, &key, "in-bot-reconcile")?
                };
                if !claimed {
                    continue;
                }
                match self.apply_in_bot(issue_number).await {
                    Ok(()) => summary.updated += 1,
                    Err(err) => {
                        self.store.insert_in_bot_pending(
                            &self.repo,
                            issue_number,
                            pr.number,
                            &pr.merged_at,
                            Some(&err.to_string()),
                        )?;
                        summary.pending += 1;
                    }
                }
            }
            next_cursor.last_merged_at = Some(pr.merged_at.clone());
            next_cursor.last_pr_number = Some(pr.number);
        }

        if next_cursor != cursor {
            let conn = self.store.conn();
            cursors::set_in_bot_reconcile(&conn, &self.repo, &next_cursor)?;
        }
        Ok(summary)
    }

    async fn apply_in_bot(&self, issue_number: i64) -> Result<(), ReconcileError> {
        let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? else {
            return Ok(());
        };

        let delta = queue::status_delta(&snapshot.labels, TaskStatus::InBot);
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
            .clear_task_operational_fields(&self.repo, issue_number, TaskStatus::InBot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    use crate::errors::GitHubApiError;

    struct FakeTransport {
        rest_responses: Mutex<Vec<Result<crate::github::RestResponse, GitHubApiError>>>,
        fail_graphql: bool,
    }

    #[async_trait]
    impl GitHubTransport for FakeTransport {
        async fn rest(
            &self,
            _method: Method,
            _path: &str,
            _query: &[(&str, &str)],
            _body: Option<Value>,
        ) -> Result<crate::github::RestResponse, GitHubApiError> {
            self.rest_responses.lock().unwrap().remove(0)
        }

        async fn graphql(&self, query: &str, _variables: Value) -> Result<Value, GitHubApiError> {
            if self.fail_graphql {
                return Err(GitHubApiError::new("transient failure", crate::errors::GitHubErrorCode::Transient));
            }
            if query.contains("labels(first") {
                return Ok(json!({
                    "repository": {
                        "labels": {
                            "nodes": [
                                {"id": "L_inbot", "name": "ralph:status:in-bot"},
                                {"id": "L_ip", "name": "ralph:status:in-progress"},
                            ],
                            "pageInfo": {"hasNextPage": false, "endCursor": null}
                        }
                    }
                }));
            }
            Ok(json!({}))
        }
    }

    fn resp(body: Value) -> crate::github::RestResponse {
        crate::github::RestResponse { status: 200, headers: Default::default(), body, link: None, etag: None }
    }

    fn make_snapshot(repo: &str, issue_number: i64) -> crate::store::models::IssueSnapshot {
        crate::store::models::IssueSnapshot {
            repo: repo.into(),
            issue_number,
            title: "t".into(),
            state: "open".into(),
            url: format!("https://github.com/{repo}/issues/{issue_number}"),
            github_node_id: format!("I_{issue_number}"),
            github_updated_at: "2026-02-11T14:00:00Z".into(),
            labels: vec!["ralph:status:in-progress".into()],
        }
    }

    #[tokio::test]
    async fn first_run_initializes_cursor_to_now_without_scanning() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = Arc::new(FakeTransport { rest_responses: Mutex::new(vec![]), fail_graphql: false });
        let reconciler = InBotReconciler {
            store: store.clone(),
            transport,
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
            bot_branch: "bot/integration".into(),
        };

        let summary = reconciler.tick().await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());

        let conn = store.conn();
        let cursor = cursors::get_in_bot_reconcile(&conn, "acme/widgets").unwrap();
        assert_eq!(cursor.bot_branch.as_deref(), Some("bot/integration"));
        assert!(cursor.last_merged_at.is_some());
    }

    #[tokio::test]
    async fn scenario_s3_label_write_failure_then_recovery() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_issue_snapshot(&make_snapshot("acme/widgets", 673)).unwrap();
        {
            let conn = store.conn();
            cursors::set_in_bot_reconcile(
                &conn,
                "acme/widgets",
                &InBotReconcileCursor {
                    bot_branch: Some("bot/integration".into()),
                    last_merged_at: Some("2026-02-11T13:00:00.000Z".into()),
                    last_pr_number: Some(10),
                },
            )
            .unwrap();
        }

        let failing_transport = Arc::new(FakeTransport {
            rest_responses: Mutex::new(vec![Ok(resp(json!([
                {"number": 622, "merged_at": "2026-02-11T14:08:00.000Z", "body": "closes #673", "base": {"ref": "bot/integration"}},
            ])))]),
            fail_graphql: true,
        });
        let reconciler = InBotReconciler {
            store: store.clone(),
            transport: failing_transport,
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
            bot_branch: "bot/integration".into(),
        };
        let summary = reconciler.tick().await.unwrap();
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.pending, 1);

        let conn = store.conn();
        let cursor = cursors::get_in_bot_reconcile(&conn, "acme/widgets").unwrap();
        assert_eq!(cursor.last_merged_at.as_deref(), Some("2026-02-11T14:08:00.000Z"));
        assert_eq!(cursor.last_pr_number, Some(622));
        assert_eq!(store.list_in_bot_pending("acme/widgets").unwrap().len(), 1);
        drop(conn);

        let succeeding_transport = Arc::new(FakeTransport { rest_responses: Mutex::new(vec![]), fail_graphql: false });
        let reconciler = InBotReconciler {
            store: store.clone(),
            transport: succeeding_transport,
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
            bot_branch: "bot/integration".into(),
        };
        let summary = reconciler.tick().await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.pending, 0);
        assert!(store.list_in_bot_pending("acme/widgets").unwrap().is_empty());
    }

    #[tokio::test]
    async fn branch_change_resets_cursor_and_clears_pending() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .insert_in_bot_pending("acme/widgets", 1, 1, "2026-01-01T00:00:00Z", None)
            .unwrap();
        {
            let conn = store.conn();
            cursors::set_in_bot_reconcile(
                &conn,
                "acme/widgets",
                &InBotReconcileCursor {
                    bot_branch: Some("bot/old".into()),
                    last_merged_at: Some("2026-01-01T00:00:00Z".into()),
                    last_pr_number: Some(1),
                },
            )
            .unwrap();
        }
        let transport = Arc::new(FakeTransport { rest_responses: Mutex::new(vec![]), fail_graphql: false });
        let reconciler = InBotReconciler {
            store: store.clone(),
            transport,
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
            bot_branch: "bot/new".into(),
        };
        reconciler.tick().await.unwrap();

        assert!(store.list_in_bot_pending("acme/widgets").unwrap().is_empty());
        let conn = store.conn();
        let cursor = cursors::get_in_bot_reconcile(&conn, "acme/widgets").unwrap();
        assert_eq!(cursor.bot_branch.as_deref(), Some("bot/new"));
    }
}
