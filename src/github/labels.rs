//! Label read/write operations and the workflow-label convergence diff (§4.B, §4.D).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::{GitHubApiError, GitHubErrorCode};
use crate::github::GitHubTransport;
use crate::queue::LabelDelta;

/// A label as GitHub reports it, or as ralph wants it to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    /// 6 hex digits, no leading `#`.
    pub color: String,
    pub description: String,
}

fn normalize_color(color: &str) -> String {
    color.trim_start_matches('#').to_ascii_lowercase()
}

/// Diff a repo's existing labels against ralph's canonical workflow-label list.
/// Name comparison is case-insensitive; color comparison ignores a leading `#` and
/// case; a null/missing description is treated as empty. Never proposes deletions —
/// per §4.D the driver only creates and updates, it never removes third-party labels.
///
/// When multiple existing labels match a canonical name under case-folding, the
/// exact-cased duplicate (if any) is preferred as the update target.
pub fn diff_labels(
    existing: &[LabelSpec],
    canonical: &[LabelSpec],
) -> (Vec<LabelSpec>, Vec<LabelSpec>) {
    let mut to_create = Vec::new();
    let mut to_update = Vec::new();

    for want in canonical {
        let matches: Vec<&LabelSpec> = existing
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(&want.name))
            .collect();

        let chosen = matches
            .iter()
            .find(|e| e.name == want.name)
            .or_else(|| matches.first());

        match chosen {
            None => to_create.push(want.clone()),
            Some(have) => {
                let colors_match = normalize_color(&have.color) == normalize_color(&want.color);
                let descriptions_match = have.description == want.description;
                if !colors_match || !descriptions_match || have.name != want.name {
                    to_update.push(want.clone());
                }
            }
        }
    }

    (to_create, to_update)
}

const LABEL_PAGE_QUERY: &str = "query($owner:String!,$name:String!,$after:String) {\
  repository(owner:$owner, name:$name) {\
    id\
    labels(first:100, after:$after) { nodes { id name } pageInfo { hasNextPage endCursor } }\
  }\
}";

const ADD_LABELS_MUTATION: &str = "mutation($labelableId:ID!,$labelIds:[ID!]!) {\
  addLabelsToLabelable(input:{labelableId:$labelableId, labelIds:$labelIds}) { clientMutationId }\
}";

const REMOVE_LABELS_MUTATION: &str = "mutation($labelableId:ID!,$labelIds:[ID!]!) {\
  removeLabelsFromLabelable(input:{labelableId:$labelableId, labelIds:$labelIds}) { clientMutationId }\
}";

/// Caches `label name -> node id` per repo for the process lifetime (§4.B "cached
/// per repo per process lifetime"), since the id never changes once a label exists
/// and re-resolving it on every mutation would be one extra round trip per write.
#[derive(Default)]
pub struct LabelIdCache {
    by_repo: DashMap<String, Arc<HashMap<String, String>>>,
}

impl LabelIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch and cache every label's node id for `owner/name`, paginating with
    /// `pageInfo` the same way the relationship engine treats GraphQL coverage —
    /// a response missing `hasNextPage` is never treated as complete.
    async fn load(
        &self,
        transport: &dyn GitHubTransport,
        owner: &str,
        name: &str,
    ) -> Result<Arc<HashMap<String, String>>, GitHubApiError> {
        let mut ids = HashMap::new();
        let mut after: Option<String> = None;
        loop {
            let data = transport
                .graphql(
                    LABEL_PAGE_QUERY,
                    json!({ "owner": owner, "name": name, "after": after }),
                )
                .await?;
            let labels = data
                .get("repository")
                .and_then(|r| r.get("labels"))
                .ok_or_else(|| {
                    GitHubApiError::new("malformed labels response", GitHubErrorCode::Unknown)
                })?;
            let nodes = labels.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();
            for node in nodes {
                if let (Some(id), Some(label_name)) = (
                    node.get("id").and_then(Value::as_str),
                    node.get("name").and_then(Value::as_str),
                ) {
                    ids.insert(label_name.to_string(), id.to_string());
                }
            }
            let page_info = labels.get("pageInfo");
            let has_next = page_info.and_then(|p| p.get("hasNextPage")).and_then(Value::as_bool);
            match has_next {
                Some(true) => {
                    after = page_info
                        .and_then(|p| p.get("endCursor"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                _ => break,
            }
        }
        let ids = Arc::new(ids);
        self.by_repo.insert(format!("{owner}/{name}"), ids.clone());
        Ok(ids)
    }

    async fn ids_for(
        &self,
        transport: &dyn GitHubTransport,
        owner: &str,
        name: &str,
    ) -> Result<Arc<HashMap<String, String>>, GitHubApiError> {
        if let Some(cached) = self.by_repo.get(&format!("{owner}/{name}")) {
            return Ok(cached.clone());
        }
        self.load(transport, owner, name).await
    }
}

/// Applies a [`LabelDelta`] to one issue via `addLabelsToLabelable`/
/// `removeLabelsFromLabelable` (§4.B), resolving each named label to its GraphQL
/// node id through `cache` first. A label named in the delta that doesn't exist yet
/// on the repo is skipped rather than failing the whole mutation — workflow labels
/// are expected to already be converged by the time the queue driver computes deltas.
pub async fn mutate_issue_labels(
    transport: &dyn GitHubTransport,
    cache: &LabelIdCache,
    owner: &str,
    repo_name: &str,
    labelable_id: &str,
    delta: &LabelDelta,
) -> Result<(), GitHubApiError> {
    if delta.add.is_empty() && delta.remove.is_empty() {
        return Ok(());
    }
    let ids = cache.ids_for(transport, owner, repo_name).await?;

    let add_ids: Vec<&String> = delta.add.iter().filter_map(|name| ids.get(name)).collect();
    if !add_ids.is_empty() {
        transport
            .graphql(
                ADD_LABELS_MUTATION,
                json!({ "labelableId": labelable_id, "labelIds": add_ids }),
            )
            .await?;
    }

    let remove_ids: Vec<&String> = delta.remove.iter().filter_map(|name| ids.get(name)).collect();
    if !remove_ids.is_empty() {
        transport
            .graphql(
                REMOVE_LABELS_MUTATION,
                json!({ "labelableId": labelable_id, "labelIds": remove_ids }),
            )
            .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::Method;
    use std::sync::Mutex;

    struct FakeTransport {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()) }
        }
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
            unimplemented!("labels mutation only uses graphql")
        }

        async fn graphql(&self, query: &str, variables: Value) -> Result<Value, GitHubApiError> {
            self.calls.lock().unwrap().push((query.to_string(), variables.clone()));
            if query.contains("labels(first") {
                Ok(json!({
                    "repository": {
                        "id": "R_repo",
                        "labels": {
                            "nodes": [
                                {"id": "L_1", "name": "status:queued"},
                                {"id": "L_2", "name": "status:in-progress"},
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

    #[tokio::test]
    async fn no_op_delta_makes_no_requests() {
        let transport = FakeTransport::new();
        let cache = LabelIdCache::new();
        let delta = LabelDelta { add: vec![], remove: vec![] };
        mutate_issue_labels(&transport, &cache, "acme", "widgets", "I_1", &delta).await.unwrap();
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolves_ids_and_emits_add_and_remove_mutations() {
        let transport = FakeTransport::new();
        let cache = LabelIdCache::new();
        let delta = LabelDelta {
            add: vec!["status:in-progress".to_string()],
            remove: vec!["status:queued".to_string()],
        };
        mutate_issue_labels(&transport, &cache, "acme", "widgets", "I_1", &delta).await.unwrap();

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3, "one label-list fetch plus one add plus one remove mutation");
        assert!(calls[0].0.contains("labels(first"));
        assert!(calls[1].0.contains("addLabelsToLabelable"));
        assert_eq!(calls[1].1["labelIds"], json!(["L_2"]));
        assert!(calls[2].0.contains("removeLabelsFromLabelable"));
        assert_eq!(calls[2].1["labelIds"], json!(["L_1"]));
    }

    #[tokio::test]
    async fn second_mutation_reuses_cached_ids() {
        let transport = FakeTransport::new();
        let cache = LabelIdCache::new();
        let delta = LabelDelta { add: vec!["status:queued".to_string()], remove: vec![] };

        mutate_issue_labels(&transport, &cache, "acme", "widgets", "I_1", &delta).await.unwrap();
        mutate_issue_labels(&transport, &cache, "acme", "widgets", "I_2", &delta).await.unwrap();

        let calls = transport.calls.lock().unwrap();
        let fetches = calls.iter().filter(|(q, _)| q.contains("labels(first")).count();
        assert_eq!(fetches, 1, "second call should hit the cache, not re-fetch");
    }

    #[tokio::test]
    async fn unknown_label_name_is_skipped_rather_than_erroring() {
        let transport = FakeTransport::new();
        let cache = LabelIdCache::new();
        let delta = LabelDelta { add: vec!["does-not-exist".to_string()], remove: vec![] };
        mutate_issue_labels(&transport, &cache, "acme", "widgets", "I_1", &delta).await.unwrap();

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "only the resolution fetch, no mutation for an unresolvable label");
    }

    fn spec(name: &str, color: &str, description: &str) -> LabelSpec {
        LabelSpec {
            name: name.into(),
            color: color.into(),
            description: description.into(),
        }
    }

    #[test]
    fn missing_label_is_proposed_for_creation() {
        let (to_create, to_update) = diff_labels(&[], &[spec("status:queued", "ededed", "Queued")]);
        assert_eq!(to_create, vec![spec("status:queued", "ededed", "Queued")]);
        assert!(to_update.is_empty());
    }

    #[test]
    fn matching_label_needs_no_update() {
        let existing = vec![spec("status:queued", "ededed", "Queued")];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (to_create, to_update) = diff_labels(&existing, &canonical);
        assert!(to_create.is_empty());
        assert!(to_update.is_empty());
    }

    #[test]
    fn color_mismatch_after_normalizing_hash_and_case_triggers_update() {
        let existing = vec![spec("status:queued", "#EDEDED", "Queued")];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (_, to_update) = diff_labels(&existing, &canonical);
        assert!(to_update.is_empty(), "normalized colors should match, no update needed");

        let existing2 = vec![spec("status:queued", "ff0000", "Queued")];
        let (_, to_update2) = diff_labels(&existing2, &canonical);
        assert_eq!(to_update2.len(), 1);
    }

    #[test]
    fn description_mismatch_triggers_update() {
        let existing = vec![spec("status:queued", "ededed", "old description")];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (_, to_update) = diff_labels(&existing, &canonical);
        assert_eq!(to_update.len(), 1);
    }

    #[test]
    fn case_insensitive_name_match_prefers_exact_case_duplicate() {
        let existing = vec![
            spec("Status:Queued", "ededed", "wrong case"),
            spec("status:queued", "ededed", "Queued"),
        ];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (to_create, to_update) = diff_labels(&existing, &canonical);
        assert!(to_create.is_empty());
        assert!(to_update.is_empty(), "the exact-case duplicate already matches");
    }

    #[test]
    fn casing_difference_without_exact_match_triggers_update() {
        let existing = vec![spec("Status:Queued", "ededed", "Queued")];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (to_create, to_update) = diff_labels(&existing, &canonical);
        assert!(to_create.is_empty());
        assert_eq!(to_update.len(), 1);
    }

    #[test]
    fn never_proposes_deletion_of_unrelated_labels() {
        let existing = vec![spec("good-first-issue", "7057ff", "")];
        let canonical = vec![spec("status:queued", "ededed", "Queued")];
        let (to_create, _) = diff_labels(&existing, &canonical);
        assert_eq!(to_create.len(), 1);
        // no third return value exists for deletions; the function signature itself
        // enforces this invariant.
    }
}
