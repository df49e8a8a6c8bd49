//! Failure classification (§4.G "Error classification"): maps whatever went wrong
//! during a stage invocation — a classified GitHub error, a guardrail kill, or the
//! agent subprocess's own exit — onto the four outcomes the claim loop acts on.
//! Mirrors [`crate::github::error::is_retryable`]'s code-to-bucket shape, widened to
//! cover non-GitHub failure sources.

use std::time::Duration;

use rand::Rng;

use crate::errors::GitHubErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Credentials are wrong or the installation lacks permission; retrying without
    /// operator intervention cannot help.
    NonRetriableAuth,
    /// GitHub is rate-limiting; resume after the window the API told us about.
    RateLimit,
    /// Likely to succeed on retry with no operator action: network blips, 5xx,
    /// guardrail soft-kills, agent process crashes.
    Transient,
    /// Anything the classifier can't place with confidence; escalate rather than
    /// spin forever.
    Unknown,
}

/// Classify a GitHub API failure encountered mid-stage.
pub fn classify_github_error(code: &GitHubErrorCode) -> FailureClass {
    match code {
        GitHubErrorCode::Auth => FailureClass::NonRetriableAuth,
        GitHubErrorCode::RateLimit => FailureClass::RateLimit,
        GitHubErrorCode::Server | GitHubErrorCode::Transient | GitHubErrorCode::Network => {
            FailureClass::Transient
        }
        GitHubErrorCode::NotFound | GitHubErrorCode::Validation | GitHubErrorCode::Unknown => {
            FailureClass::Unknown
        }
    }
}

/// Classify an agent subprocess's own exit. A clean zero exit is not a failure at
/// all and has no classification; callers only reach this function once a stage has
/// already failed.
pub fn classify_agent_exit(exit_code: Option<i32>, killed_by_guardrail: bool) -> FailureClass {
    if killed_by_guardrail {
        return FailureClass::Transient;
    }
    match exit_code {
        // Conventionally reserved by shells for "terminated by signal" — the agent
        // process was killed by something outside the guardrail (OOM killer, operator).
        Some(code) if code >= 128 => FailureClass::Transient,
        Some(_) => FailureClass::Unknown,
        None => FailureClass::Transient,
    }
}

/// Attempt backoff: `min(cap, base * 2^(attempt-1))` plus up to 400ms of jitter
/// (§4.G). `attempt` is 1-indexed; the first retry uses `attempt = 1`.
pub fn retry_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(cap.as_millis() as u64);
    let jitter = rand::rng().random_range(0..=400u64);
    Duration::from_millis(capped + jitter)
}
