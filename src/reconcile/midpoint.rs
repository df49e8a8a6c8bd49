//! Midpoint labeler (§4.H): a best-effort label removal fired the moment a task's
//! PR merges to the bot integration branch, ahead of the polling in-bot
//! reconciler's own pass. Strictly best-effort — a failure here is logged and
//! surfaces as an error notification, but must never fail the PR path that
//! triggered it.

use std::sync::Arc;

use crate::errors::ReconcileError;
use crate::github::GitHubTransport;
use crate::github::labels::{LabelIdCache, mutate_issue_labels};
use crate::queue::LabelDelta;

pub struct MidpointLabeler {
    pub store: Arc<crate::store::Store>,
    pub transport: Arc<dyn GitHubTransport>,
    pub label_cache: Arc<LabelIdCache>,
    pub repo: String,
}

impl MidpointLabeler {
    /// Remove `ralph:status:in-progress` from `issue_number`, if present. Swallows
    /// and logs any failure rather than returning it — callers on the PR-merge path
    /// must not let this block.
    pub async fn try_remove_in_progress(&self, issue_number: i64) {
        if let Err(err) = self.remove_in_progress(issue_number).await {
            tracing::warn!(
                repo = %self.repo, issue = issue_number, error = %err,
                "midpoint labeler failed to remove in-progress label",
            );
        }
    }

    async fn remove_in_progress(&self, issue_number: i64) -> Result<(), ReconcileError> {
        let Some(snapshot) = self.store.get_issue_snapshot(&self.repo, issue_number)? else {
            return Ok(());
        };
        if !snapshot.labels.iter().any(|l| l == "ralph:status:in-progress") {
            return Ok(());
        }

        let delta = LabelDelta { add: vec![], remove: vec!["ralph:status:in-progress".to_string()] };
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
        next_snapshot.labels = crate::queue::apply_delta(&snapshot.labels, &delta);
        self.store.upsert_issue_snapshot(&next_snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::{Value, json};

    use crate::errors::GitHubApiError;
    use crate::store::Store;
    use crate::store::models::IssueSnapshot;

    struct FakeTransport;

    #[async_trait]
    impl GitHubTransport for FakeTransport {
        async fn rest(
            &self,
            _method: Method,
            _path: &str,
            _query: &[(&str, &str)],
            _body: Option<Value>,
        ) -> Result<crate::github::RestResponse, GitHubApiError> {
            Ok(crate::github::RestResponse { status: 200, headers: Default::default(), body: json!({}), link: None, etag: None })
        }

        async fn graphql(&self, query: &str, _variables: Value) -> Result<Value, GitHubApiError> {
            if query.contains("labels(first") {
                return Ok(json!({
                    "repository": {
                        "labels": {
                            "nodes": [{"id": "L_ip", "name": "ralph:status:in-progress"}],
                            "pageInfo": {"hasNextPage": false, "endCursor": null}
                        }
                    }
                }));
            }
            Ok(json!({}))
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl GitHubTransport for FailingTransport {
        async fn rest(
            &self,
            _method: Method,
            _path: &str,
            _query: &[(&str, &str)],
            _body: Option<Value>,
        ) -> Result<crate::github::RestResponse, GitHubApiError> {
            Err(GitHubApiError::new("boom", crate::errors::GitHubErrorCode::Transient))
        }

        async fn graphql(&self, _query: &str, _variables: Value) -> Result<Value, GitHubApiError> {
            Err(GitHubApiError::new("boom", crate::errors::GitHubErrorCode::Transient))
        }
    }

    fn snapshot() -> IssueSnapshot {
        IssueSnapshot {
            repo: "acme/widgets".into(),
            issue_number: 42,
            title: "t".into(),
            state: "open".into(),
            url: "https://github.com/acme/widgets/issues/42".into(),
            github_node_id: "I_42".into(),
            github_updated_at: "2026-02-11T14:00:00Z".into(),
            labels: vec!["ralph:status:in-progress".into(), "bug".into()],
        }
    }

    #[tokio::test]
    async fn removes_in_progress_label() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_issue_snapshot(&snapshot()).unwrap();
        let labeler = MidpointLabeler {
            store: store.clone(),
            transport: Arc::new(FakeTransport),
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
        };

        labeler.remove_in_progress(42).await.unwrap();

        let updated = store.get_issue_snapshot("acme/widgets", 42).unwrap().unwrap();
        assert_eq!(updated.labels, vec!["bug".to_string()]);
    }

    #[tokio::test]
    async fn absent_label_is_a_noop() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_issue_snapshot(&IssueSnapshot { labels: vec!["bug".into()], ..snapshot() })
            .unwrap();
        let labeler = MidpointLabeler {
            store: store.clone(),
            transport: Arc::new(FailingTransport),
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
        };

        // Would fail if it attempted a GitHub call; the no-label-present short
        // circuit must skip the network entirely.
        labeler.remove_in_progress(42).await.unwrap();
    }

    #[tokio::test]
    async fn try_remove_in_progress_swallows_failures() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.upsert_issue_snapshot(&snapshot()).unwrap();
        let labeler = MidpointLabeler {
            store: store.clone(),
            transport: Arc::new(FailingTransport),
            label_cache: Arc::new(LabelIdCache::new()),
            repo: "acme/widgets".into(),
        };

        // Must not panic despite the transport failing.
        labeler.try_remove_in_progress(42).await;
    }
}
