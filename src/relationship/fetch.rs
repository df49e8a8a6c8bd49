//! GitHub-backed signal collection for the relationship engine (§4.E).
//!
//! Tries REST first, falls back to GraphQL, and remembers per-`(repo, kind)`
//! capability in a [`CapabilityLadder`] so a repo that never gained the REST
//! dependency endpoints doesn't eat a 404 on every tick. Built on the same
//! REST-pagination-by-`Link`-header and GraphQL-`pageInfo` idioms as
//! [`crate::github::ops`] and [`crate::github::labels`].

use reqwest::Method;
use serde_json::{Value, json};

use crate::errors::GitHubApiError;
use crate::github::GitHubTransport;
use crate::github::pagination::{PageInfo, parse_link_next};
use crate::relationship::{
    Capability, CapabilityLadder, Coverage, RelationshipReport, Signal, SignalKind, SignalSource,
    SignalState, kind_coverage_complete, parse_body_dependencies,
};

fn repo_parts(repo: &str) -> Result<(&str, &str), GitHubApiError> {
    repo.split_once('/').ok_or_else(|| {
        GitHubApiError::new(
            format!("repo slug {repo} is not in owner/name form"),
            crate::errors::GitHubErrorCode::Validation,
        )
    })
}

fn rest_path(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::BlockedBy => "blocked_by",
        SignalKind::SubIssue => "sub_issues",
    }
}

fn state_from_json(item: &Value) -> SignalState {
    match item.get("state").and_then(Value::as_str) {
        Some("open") => SignalState::Open,
        Some("closed") => SignalState::Closed,
        _ => SignalState::Unknown,
    }
}

fn reference_from_json(item: &Value, own_repo: &str) -> String {
    let number = item.get("number").and_then(Value::as_i64).unwrap_or_default();
    let repo = item
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(Value::as_str)
        .unwrap_or(own_repo);
    format!("{repo}#{number}")
}

async fn fetch_rest(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    kind: SignalKind,
) -> Result<Option<(Vec<Signal>, bool)>, GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let mut path = format!("/repos/{owner}/{name}/issues/{issue_number}/{}", rest_path(kind));
    let mut query: Vec<(&str, &str)> = vec![("per_page", "100")];
    let mut signals = Vec::new();
    let mut has_next = false;

    loop {
        let resp = match transport.rest(Method::GET, &path, &query, None).await {
            Ok(r) => r,
            Err(err) if err.status == Some(404) => return Ok(None),
            Err(err) => return Err(err),
        };
        for item in resp.body.as_array().cloned().unwrap_or_default() {
            signals.push(Signal {
                source: SignalSource::Github,
                kind,
                state: state_from_json(&item),
                reference: reference_from_json(&item, repo),
            });
        }
        match resp.link.as_deref().and_then(parse_link_next) {
            Some(next) => {
                path = next;
                query = Vec::new();
                has_next = true;
            }
            None => {
                has_next = false;
                break;
            }
        }
    }
    Ok(Some((signals, has_next)))
}

const BLOCKED_BY_QUERY: &str = "query($owner:String!,$name:String!,$number:Int!,$after:String) {\
  repository(owner:$owner, name:$name) {\
    issue(number:$number) {\
      blockedBy: trackedIssues(first:50, after:$after) {\
        nodes { number state repository { nameWithOwner } }\
        pageInfo { hasNextPage endCursor }\
      }\
    }\
  }\
}";

const SUB_ISSUE_QUERY: &str = "query($owner:String!,$name:String!,$number:Int!,$after:String) {\
  repository(owner:$owner, name:$name) {\
    issue(number:$number) {\
      subIssues(first:50, after:$after) {\
        nodes { number state repository { nameWithOwner } }\
        pageInfo { hasNextPage endCursor }\
      }\
    }\
  }\
}";

fn graphql_query(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::BlockedBy => BLOCKED_BY_QUERY,
        SignalKind::SubIssue => SUB_ISSUE_QUERY,
    }
}

fn graphql_field(kind: SignalKind) -> &'static str {
    match kind {
        SignalKind::BlockedBy => "blockedBy",
        SignalKind::SubIssue => "subIssues",
    }
}

async fn fetch_graphql(
    transport: &dyn GitHubTransport,
    repo: &str,
    issue_number: i64,
    kind: SignalKind,
) -> Result<(Vec<Signal>, bool), GitHubApiError> {
    let (owner, name) = repo_parts(repo)?;
    let mut after: Option<String> = None;
    let mut signals = Vec::new();
    let mut last_page_info: Option<PageInfo> = None;

    loop {
        let data = transport
            .graphql(
                graphql_query(kind),
                json!({ "owner": owner, "name": name, "number": issue_number, "after": after }),
            )
            .await?;
        let connection = data
            .get("repository")
            .and_then(|r| r.get("issue"))
            .and_then(|i| i.get(graphql_field(kind)));
        let Some(connection) = connection else { break };

        for node in connection.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default() {
            signals.push(Signal {
                source: SignalSource::Github,
                kind,
                state: state_from_json(&node),
                reference: reference_from_json(&node, repo),
            });
        }
        let has_next = connection.get("pageInfo").and_then(|p| p.get("hasNextPage")).and_then(Value::as_bool);
        let end_cursor = connection
            .get("pageInfo")
            .and_then(|p| p.get("endCursor"))
            .and_then(Value::as_str)
            .map(str::to_string);
        last_page_info = has_next.map(|has_next_page| PageInfo { has_next_page, end_cursor: end_cursor.clone() });

        if has_next == Some(true) && end_cursor.is_some() {
            after = end_cursor;
        } else {
            break;
        }
    }
    Ok((signals, kind_coverage_complete(None, last_page_info.as_ref())))
}

/// Collect signals for one `kind`, climbing the REST → GraphQL ladder and
/// recording capability transitions on `ladder` (§4.E).
async fn collect_kind(
    transport: &dyn GitHubTransport,
    ladder: &CapabilityLadder,
    repo: &str,
    issue_number: i64,
    kind: SignalKind,
) -> (Vec<Signal>, bool) {
    let capability = ladder.capability(repo, kind);

    if capability != Capability::RestUnavailable && capability != Capability::GloballyUnavailable {
        match fetch_rest(transport, repo, issue_number, kind).await {
            Ok(Some((signals, has_next))) => return (signals, !has_next),
            Ok(None) => ladder.mark_rest_unavailable(repo, kind),
            Err(_) => ladder.mark_rest_unavailable(repo, kind),
        }
    }

    if ladder.capability(repo, kind) == Capability::GloballyUnavailable {
        return (Vec::new(), false);
    }

    match fetch_graphql(transport, repo, issue_number, kind).await {
        Ok((signals, complete)) => (signals, complete),
        Err(err) => {
            let semantically_unavailable = matches!(
                err.status,
                Some(401) | Some(403) | Some(404)
            ) || err.message.contains("errors:");
            if semantically_unavailable {
                ladder.mark_globally_unavailable(repo, kind);
            }
            (Vec::new(), false)
        }
    }
}

/// Build the full [`RelationshipReport`] for one issue: github-sourced `blocked_by`
/// and `sub_issue` signals via the capability ladder, plus body-derived `Blocked by`
/// checkbox references (§4.E).
pub async fn collect_signals(
    transport: &dyn GitHubTransport,
    ladder: &CapabilityLadder,
    repo: &str,
    issue_number: i64,
    issue_body: &str,
) -> RelationshipReport {
    let (blocked_by, deps_complete) =
        collect_kind(transport, ladder, repo, issue_number, SignalKind::BlockedBy).await;
    let (sub_issues, sub_issues_complete) =
        collect_kind(transport, ladder, repo, issue_number, SignalKind::SubIssue).await;

    let body_signals = parse_body_dependencies(issue_body, repo);
    let body_deps = !body_signals.is_empty();

    let mut signals = blocked_by;
    signals.extend(sub_issues);
    signals.extend(body_signals);

    RelationshipReport {
        signals,
        coverage: Coverage { deps_complete, sub_issues_complete, body_deps },
    }
}
