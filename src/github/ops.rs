//! Thin REST operations the scheduler and reconcilers drive directly, on top of the
//! [`GitHubTransport`](super::GitHubTransport) capability trait (§4.G, §4.H).

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Method;
use serde_json::{Value, json};

use crate::errors::GitHubApiError;
use crate::github::GitHubTransport;
use crate::github::pagination::parse_link_next;

/// An issue or PR comment, the subset of fields the escalation/verification
/// reconcilers need.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub author_association: String,
    pub created_at: String,
}

/// A merged pull request as the done/in-bot reconcilers observe it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPr {
    pub number: i64,
    pub merged_at: String,
    pub body: String,
    pub base_ref: String,
}

fn repo_parts(repo: &str) -> Result<(&str, &str), GitHubApiError> {
    repo.split_once('/').ok_or_else(|| {
        GitHubApiError::new(
            format!("repo slug {repo} is not in owner/name form"),
            crate::errors::GitHubErrorCode::Validation,
        )
    })
}

pub async fn list_issue_labels(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
) -> Result<Vec<String>, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let resp = transport
        .rest(
            Method::GET,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/labels"),
            &[],
            None,
        )
        .await?;
    let names = resp
        .body
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

/// Replace an issue's entire label set (`PUT .../labels`), the primitive the queue
/// driver's computed [`crate::queue::LabelDelta`] is applied through.
pub async fn set_issue_labels(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    labels: &[String],
) -> Result<(), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    transport
        .rest(
            Method::PUT,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/labels"),
            &[],
            Some(json!({ "labels": labels })),
        )
        .await?;
    Ok(())
}

pub async fn patch_issue_state(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    state: &str,
) -> Result<(), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    transport
        .rest(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/issues/{issue_number}"),
            &[],
            Some(json!({ "state": state })),
        )
        .await?;
    Ok(())
}

/// An issue's current detail, fetched fresh (not the store's cached snapshot), for
/// callers that need the body text alongside the label-bearing snapshot fields.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDetail {
    pub title: String,
    pub state: String,
    pub url: String,
    pub node_id: String,
    pub updated_at: String,
    pub labels: Vec<String>,
    pub body: String,
}

/// Fetch an issue's full detail straight from GitHub, used for the driver's
/// best-effort snapshot rehydration (§4.D) and the relationship engine's
/// body-dependency parsing (§4.E), neither of which is cached in
/// [`crate::store::models::IssueSnapshot`].
pub async fn fetch_issue(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
) -> Result<IssueDetail, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let resp = transport
        .rest(Method::GET, &format!("/repos/{owner}/{name}/issues/{issue_number}"), &[], None)
        .await?;
    let v = &resp.body;
    let labels = v
        .get("labels")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(IssueDetail {
        title: v.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
        state: v.get("state").and_then(Value::as_str).unwrap_or_default().to_string(),
        url: v.get("html_url").and_then(Value::as_str).unwrap_or_default().to_string(),
        node_id: v.get("node_id").and_then(Value::as_str).unwrap_or_default().to_string(),
        updated_at: v.get("updated_at").and_then(Value::as_str).unwrap_or_default().to_string(),
        labels,
        body: v.get("body").and_then(Value::as_str).unwrap_or_default().to_string(),
    })
}

fn comment_from_json(v: &Value) -> Option<Comment> {
    Some(Comment {
        id: v.get("id")?.as_i64()?,
        body: v.get("body")?.as_str()?.to_string(),
        author_association: v.get("author_association")?.as_str()?.to_string(),
        created_at: v.get("created_at")?.as_str()?.to_string(),
    })
}

/// List up to `limit` of the most recent comments on an issue or PR, newest last
/// (GitHub's natural order), truncated to `limit` by dropping the oldest.
pub async fn list_recent_comments(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    limit: usize,
) -> Result<Vec<Comment>, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let per_page = limit.min(100).max(1).to_string();
    let resp = transport
        .rest(
            Method::GET,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/comments"),
            &[("per_page", per_page.as_str()), ("sort", "created"), ("direction", "desc")],
            None,
        )
        .await?;
    let mut comments: Vec<Comment> = resp
        .body
        .as_array()
        .map(|arr| arr.iter().filter_map(comment_from_json).collect())
        .unwrap_or_default();
    comments.truncate(limit);
    Ok(comments)
}

pub async fn post_comment(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    body: &str,
) -> Result<Comment, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let resp = transport
        .rest(
            Method::POST,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/comments"),
            &[],
            Some(json!({ "body": body })),
        )
        .await?;
    comment_from_json(&resp.body).ok_or_else(|| {
        GitHubApiError::new("malformed comment response", crate::errors::GitHubErrorCode::Unknown)
    })
}

pub async fn patch_comment(
    transport: &dyn GitHubTransport,
    repo: &str,
    comment_id: i64,
    body: &str,
) -> Result<(), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    transport
        .rest(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/issues/comments/{comment_id}"),
            &[],
            Some(json!({ "body": body })),
        )
        .await?;
    Ok(())
}

fn merged_pr_from_json(v: &Value) -> Option<MergedPr> {
    let merged_at = v.get("merged_at")?.as_str()?;
    Some(MergedPr {
        number: v.get("number")?.as_i64()?,
        merged_at: merged_at.to_string(),
        body: v.get("body").and_then(Value::as_str).unwrap_or_default().to_string(),
        base_ref: v.get("base")?.get("ref")?.as_str()?.to_string(),
    })
}

/// List PRs merged into `base_branch` with `merged_at > since_iso`, oldest first,
/// following `Link: rel="next"` until the page crosses back before `since_iso`
/// (closed PRs are requested newest-updated-first, so this bounds the scan window).
pub async fn list_merged_prs_since(
    transport: &dyn GitHubTransport,
    repo: &str,
    base_branch: &str,
    since_iso: &str,
) -> Result<Vec<MergedPr>, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let mut out = Vec::new();
    let mut path = format!("/repos/{owner}/{name}/pulls");
    let mut query: Vec<(&str, &str)> = vec![
        ("state", "closed"),
        ("base", base_branch),
        ("sort", "updated"),
        ("direction", "desc"),
        ("per_page", "100"),
    ];
    loop {
        let resp = transport.rest(Method::GET, &path, &query, None).await?;
        let items = resp.body.as_array().cloned().unwrap_or_default();
        if items.is_empty() {
            break;
        }
        let mut keep_going = true;
        for item in &items {
            let Some(pr) = merged_pr_from_json(item) else { continue };
            if pr.merged_at.as_str() > since_iso {
                out.push(pr);
            } else {
                keep_going = false;
            }
        }
        if !keep_going {
            break;
        }
        match resp.link.as_deref().and_then(parse_link_next) {
            Some(next) => {
                path = next;
                query = Vec::new();
            }
            None => break,
        }
    }
    out.reverse();
    Ok(out)
}

static CLOSES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s+#(\d+)").unwrap()
});

/// Issue numbers a merged PR's body closes, via the standard GitHub closing-keyword
/// syntax (`closes #N`, `fixes #N`, `resolves #N`). Same-repo only; cross-repo
/// closing references (`owner/repo#N`) are out of scope here (§9).
pub fn closing_issue_numbers(body: &str) -> Vec<i64> {
    CLOSES_RE
        .captures_iter(body)
        .filter_map(|c| c.get(2)?.as_str().parse().ok())
        .collect()
}

/// List a repo's labels as they exist on GitHub today, REST-paginated via `Link`.
pub async fn list_label_specs(
    transport: &dyn GitHubTransport,
    repo: &str,
) -> Result<Vec<crate::github::labels::LabelSpec>, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let mut out = Vec::new();
    let mut path = format!("/repos/{owner}/{name}/labels");
    let mut query: Vec<(&str, &str)> = vec![("per_page", "100")];
    loop {
        let resp = transport.rest(Method::GET, &path, &query, None).await?;
        for item in resp.body.as_array().cloned().unwrap_or_default() {
            let name = item.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let color = item.get("color").and_then(Value::as_str).unwrap_or_default().to_string();
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            out.push(crate::github::labels::LabelSpec { name, color, description });
        }
        match resp.link.as_deref().and_then(parse_link_next) {
            Some(next) => {
                path = next;
                query = Vec::new();
            }
            None => break,
        }
    }
    Ok(out)
}

pub async fn create_label(
    transport: &dyn GitHubTransport,
    repo: &str,
    spec: &crate::github::labels::LabelSpec,
) -> Result<(), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    transport
        .rest(
            Method::POST,
            &format!("/repos/{owner}/{name}/labels"),
            &[],
            Some(json!({ "name": spec.name, "color": spec.color, "description": spec.description })),
        )
        .await?;
    Ok(())
}

pub async fn update_label(
    transport: &dyn GitHubTransport,
    repo: &str,
    existing_name: &str,
    spec: &crate::github::labels::LabelSpec,
) -> Result<(), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    transport
        .rest(
            Method::PATCH,
            &format!("/repos/{owner}/{name}/labels/{existing_name}"),
            &[],
            Some(json!({ "new_name": spec.name, "color": spec.color, "description": spec.description })),
        )
        .await?;
    Ok(())
}

/// Converge a repo's labels to ralph's canonical workflow set (§4.D "first use per
/// repo"): fetch what exists, diff against [`crate::queue::canonical_labels`], and
/// create/update to match. Never deletes. Best-effort per label — one failing
/// create/update does not abort the rest of the convergence.
pub async fn ensure_workflow_labels(
    transport: &dyn GitHubTransport,
    repo: &str,
) -> Result<(), GitHubApiError> {
    let existing = list_label_specs(transport, repo).await?;
    let canonical = crate::queue::canonical_labels();
    let (to_create, to_update) = crate::github::labels::diff_labels(&existing, &canonical);

    for spec in &to_create {
        if let Err(err) = create_label(transport, repo, spec).await {
            tracing::warn!(repo, label = %spec.name, error = %err, "failed to create workflow label");
        }
    }
    for spec in &to_update {
        let existing_name = existing
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(&spec.name))
            .map(|e| e.name.as_str())
            .unwrap_or(spec.name.as_str());
        if let Err(err) = update_label(transport, repo, existing_name, spec).await {
            tracing::warn!(repo, label = %spec.name, error = %err, "failed to update workflow label");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_issue_numbers_matches_common_keywords() {
        let body = "This closes #12 and also Fixes #34, Resolved: #56.";
        assert_eq!(closing_issue_numbers(body), vec![12, 34, 56]);
    }

    #[test]
    fn closing_issue_numbers_empty_without_keywords() {
        assert!(closing_issue_numbers("see #12 for context").is_empty());
    }

    #[test]
    fn repo_parts_rejects_missing_slash() {
        assert!(repo_parts("acme-widgets").is_err());
    }
}
