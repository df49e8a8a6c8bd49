//! Relationship engine (§4.E): turns GitHub "blocked by"/sub-issue links and
//! body-derived checkbox dependencies into blocking/unblocking decisions, and
//! decides when a parent issue is eligible for verification writeback.

pub mod fetch;

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use std::sync::LazyLock;

use crate::github::pagination::{PageInfo, is_complete};

/// Where a dependency signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    Github,
    Body,
}

/// What kind of relationship a signal describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    BlockedBy,
    SubIssue,
}

/// The lifecycle state of the referenced item, as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Open,
    Closed,
    Unknown,
}

/// A single dependency/sub-issue relationship discovered for an issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub source: SignalSource,
    pub kind: SignalKind,
    pub state: SignalState,
    pub reference: String,
}

/// Whether the engine has exhaustively enumerated each kind of relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coverage {
    pub deps_complete: bool,
    pub sub_issues_complete: bool,
    pub body_deps: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipReport {
    pub signals: Vec<Signal>,
    pub coverage: Coverage,
}

/// Per-`(repo, kind)` capability: whether the API has been observed to support this
/// relationship, tried in REST-then-GraphQL order (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Unknown,
    RestUnavailable,
    GloballyUnavailable,
}

/// Tracks, per `(repo, kind)`, which transport still works for a relationship kind.
/// Populated lazily as REST/GraphQL calls succeed or are classified unavailable.
pub struct CapabilityLadder {
    state: Mutex<HashMap<(String, &'static str), Capability>>,
}

impl Default for CapabilityLadder {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityLadder {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }

    fn key(repo: &str, kind: SignalKind) -> (String, &'static str) {
        let kind_str = match kind {
            SignalKind::BlockedBy => "blocked_by",
            SignalKind::SubIssue => "sub_issue",
        };
        (repo.to_string(), kind_str)
    }

    pub fn capability(&self, repo: &str, kind: SignalKind) -> Capability {
        self.state
            .lock()
            .expect("capability ladder mutex poisoned")
            .get(&Self::key(repo, kind))
            .copied()
            .unwrap_or(Capability::Unknown)
    }

    /// Mark REST as unavailable for `(repo, kind)` after observing a 404.
    pub fn mark_rest_unavailable(&self, repo: &str, kind: SignalKind) {
        let mut state = self.state.lock().expect("capability ladder mutex poisoned");
        let key = Self::key(repo, kind);
        if !matches!(state.get(&key), Some(Capability::GloballyUnavailable)) {
            state.insert(key, Capability::RestUnavailable);
        }
    }

    /// Mark the whole kind unavailable after REST already failed and GraphQL
    /// returned 401/403/404 or non-ignored `errors[]`.
    pub fn mark_globally_unavailable(&self, repo: &str, kind: SignalKind) {
        self.state
            .lock()
            .expect("capability ladder mutex poisoned")
            .insert(Self::key(repo, kind), Capability::GloballyUnavailable);
    }
}

/// Coverage for one kind is complete iff the chosen API reported exhaustive paging.
pub fn kind_coverage_complete(rest_link_has_next: Option<bool>, graphql_page_info: Option<&PageInfo>) -> bool {
    if let Some(graphql) = graphql_page_info {
        return is_complete(Some(graphql));
    }
    match rest_link_has_next {
        Some(has_next) => !has_next,
        None => false,
    }
}

static BLOCKED_BY_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)blocked\s+by\s*:?\s*\n(.*?)(\n\n|\z)").expect("blocked-by section regex is valid")
});
static CHECKBOX_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-\s*\[[ xX]\]\s*(?:([\w.-]+/[\w.-]+))?#(\d+)").expect("checkbox ref regex is valid")
});

/// Parse a `Blocked by` checkbox section out of an issue body, emitting body-kind
/// `blocked_by` signals with state `unknown` for each `owner/repo#N` or `#N`
/// reference (resolved against `own_repo` when no owner/repo prefix is given).
pub fn parse_body_dependencies(body: &str, own_repo: &str) -> Vec<Signal> {
    let Some(section) = BLOCKED_BY_SECTION.captures(body) else {
        return Vec::new();
    };
    let block = section.get(1).map(|m| m.as_str()).unwrap_or("");

    CHECKBOX_REF
        .captures_iter(block)
        .map(|cap| {
            let repo = cap.get(1).map(|m| m.as_str()).unwrap_or(own_repo);
            let number = &cap[2];
            Signal {
                source: SignalSource::Body,
                kind: SignalKind::BlockedBy,
                state: SignalState::Unknown,
                reference: format!("{repo}#{number}"),
            }
        })
        .collect()
}

/// `blocked=true` with certain confidence iff a github-source `blocked_by` or
/// `sub_issue` signal is open. `unblocked=true` with certain confidence iff
/// coverage is complete for both kinds and no signal of those kinds is open or
/// unknown. Anything else is undecided (§4.E): blocking transitions require certainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    Blocked,
    Unblocked,
    Undecided,
}

pub fn decide_blocking(report: &RelationshipReport) -> BlockDecision {
    let github_open = report.signals.iter().any(|s| {
        s.source == SignalSource::Github
            && matches!(s.kind, SignalKind::BlockedBy | SignalKind::SubIssue)
            && s.state == SignalState::Open
    });
    if github_open {
        return BlockDecision::Blocked;
    }

    let coverage_complete = report.coverage.deps_complete && report.coverage.sub_issues_complete;
    if !coverage_complete {
        return BlockDecision::Undecided;
    }

    let any_open_or_unknown = report.signals.iter().any(|s| {
        matches!(s.kind, SignalKind::BlockedBy | SignalKind::SubIssue)
            && matches!(s.state, SignalState::Open | SignalState::Unknown)
    });
    if any_open_or_unknown {
        BlockDecision::Undecided
    } else {
        BlockDecision::Unblocked
    }
}

/// Evidence attached to a child issue backing parent-verification eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Pr,
    Commit,
    Other,
}

/// `eligible` iff sub-issue coverage is complete, at least one sub-issue signal
/// exists, none are open, no `blocked_by` is open, no state is unknown, and every
/// child carries at least one pr/commit evidence item (§4.E).
pub fn parent_verification_eligible(
    report: &RelationshipReport,
    child_evidence: &HashMap<String, Vec<EvidenceKind>>,
) -> bool {
    if !report.coverage.sub_issues_complete {
        return false;
    }
    let sub_issues: Vec<&Signal> = report
        .signals
        .iter()
        .filter(|s| s.kind == SignalKind::SubIssue)
        .collect();
    if sub_issues.is_empty() {
        return false;
    }
    if sub_issues.iter().any(|s| s.state != SignalState::Closed) {
        return false;
    }
    let open_blocked_by = report
        .signals
        .iter()
        .any(|s| s.kind == SignalKind::BlockedBy && s.state == SignalState::Open);
    if open_blocked_by {
        return false;
    }
    if report.signals.iter().any(|s| s.state == SignalState::Unknown) {
        return false;
    }
    sub_issues.iter().all(|s| {
        child_evidence
            .get(&s.reference)
            .is_some_and(|items| items.iter().any(|e| matches!(e, EvidenceKind::Pr | EvidenceKind::Commit)))
    })
}
