//! Typed error hierarchy for the ralph daemon.
//!
//! Each subsystem gets its own `thiserror` enum so callers that need to branch on the
//! error kind can match it; callers that only need to propagate use `anyhow::Result`
//! with `.context(...)` and let it flow through the `Other` variant.

use thiserror::Error;

/// Errors from the persistent store (§4.A).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("schema is unreadable: on-disk version {on_disk} exceeds max writable {max_writable}")]
    UnreadableForwardIncompatible { on_disk: i64, max_writable: i64 },

    #[error("task not found: {repo}#{issue}")]
    TaskNotFound { repo: String, issue: i64 },

    #[error("run not found: {id}")]
    RunNotFound { id: i64 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the GitHub client (§4.B).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GitHubErrorCode {
    #[error("rate limited")]
    RateLimit,
    #[error("authentication or permission denied")]
    Auth,
    #[error("not found")]
    NotFound,
    #[error("validation failed")]
    Validation,
    #[error("network error")]
    Network,
    #[error("server error")]
    Server,
    #[error("transient error")]
    Transient,
    #[error("unknown error")]
    Unknown,
}

#[derive(Debug, Error)]
#[error("github api error: {message}")]
pub struct GitHubApiError {
    pub message: String,
    pub code: GitHubErrorCode,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub resume_at_ts: Option<i64>,
    pub response_text: Option<String>,
}

impl GitHubApiError {
    pub fn new(message: impl Into<String>, code: GitHubErrorCode) -> Self {
        Self {
            message: message.into(),
            code,
            status: None,
            request_id: None,
            resume_at_ts: None,
            response_text: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }
}

/// Errors from the daemon-identity subsystem (§4.C).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to read daemon record at {path}: {source}")]
    RecordReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon record at {path} is corrupt: {reason}")]
    RecordCorrupt {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("identity conflict: {count} distinct live daemons claim canonical status")]
    IdentityConflict { count: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the worker scheduler (§4.G).
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn agent subprocess: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("guardrail hard limit exceeded: {reason}")]
    GuardrailExceeded { reason: String },

    #[error("stage {stage} depends on unknown stage {dependency}")]
    UnknownStage { stage: String, dependency: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the reconciliation loops (§4.H).
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cursor read/write failed for {repo}: {source}")]
    Cursor {
        repo: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_task_not_found_carries_fields() {
        let err = StoreError::TaskNotFound {
            repo: "acme/widgets".into(),
            issue: 42,
        };
        assert!(err.to_string().contains("acme/widgets#42"));
    }

    #[test]
    fn github_api_error_builder_sets_optional_fields() {
        let err = GitHubApiError::new("rate limited", GitHubErrorCode::RateLimit)
            .with_status(403)
            .with_response_text("timestamp 2026-01-31 19:49:07 UTC");
        assert_eq!(err.status, Some(403));
        assert_eq!(err.code, GitHubErrorCode::RateLimit);
        assert!(err.response_text.unwrap().contains("2026-01-31"));
    }

    #[test]
    fn scheduler_error_converts_from_store_error() {
        let inner = StoreError::RunNotFound { id: 7 };
        let sched_err: SchedulerError = inner.into();
        match &sched_err {
            SchedulerError::Store(StoreError::RunNotFound { id }) => assert_eq!(*id, 7),
            _ => panic!("expected SchedulerError::Store(RunNotFound)"),
        }
    }

    #[test]
    fn daemon_error_identity_conflict_is_matchable() {
        let err = DaemonError::IdentityConflict { count: 2 };
        assert!(matches!(err, DaemonError::IdentityConflict { count: 2 }));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::RunNotFound { id: 1 });
        assert_std_error(&GitHubApiError::new("x", GitHubErrorCode::Unknown));
        assert_std_error(&DaemonError::IdentityConflict { count: 1 });
        assert_std_error(&SchedulerError::GuardrailExceeded {
            reason: "wall-time".into(),
        });
        assert_std_error(&ReconcileError::Other(anyhow::anyhow!("x")));
    }
}
