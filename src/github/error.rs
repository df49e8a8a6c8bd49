//! Error classification and rate-limit plan derivation (§4.B).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{GitHubApiError, GitHubErrorCode};

static SECONDARY_LIMIT_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\s+UTC").expect("valid regex")
});

/// Derive a resume time from response headers (preferred) or an embedded body
/// timestamp (secondary rate limits don't carry rate-limit headers). Returns `None`
/// when neither signal is present, meaning this isn't a rate-limit event at all.
pub fn derive_resume_at_ts(headers: &HashMap<String, String>, body_text: &str) -> Option<i64> {
    if let (Some(remaining), Some(reset)) =
        (headers.get("x-ratelimit-remaining"), headers.get("x-ratelimit-reset"))
    {
        if remaining.trim() == "0" {
            if let Ok(reset_epoch) = reset.trim().parse::<i64>() {
                return Some(reset_epoch);
            }
        }
    }
    parse_secondary_limit_timestamp(body_text)
}

fn parse_secondary_limit_timestamp(body: &str) -> Option<i64> {
    let caps = SECONDARY_LIMIT_TIMESTAMP.captures(body)?;
    let ts_str = caps.get(1)?.as_str();
    let naive = chrono::NaiveDateTime::parse_from_str(ts_str, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(naive.and_utc().timestamp())
}

/// Classify a completed HTTP response (status + headers + body) into a typed
/// [`GitHubApiError`]. Callers that hit this because `send()` itself failed (DNS,
/// connection reset) should build [`GitHubErrorCode::Network`] directly instead.
pub fn classify_response(
    status: u16,
    headers: &HashMap<String, String>,
    body_text: &str,
) -> GitHubApiError {
    let resume_at_ts = derive_resume_at_ts(headers, body_text);

    let code = if resume_at_ts.is_some() {
        GitHubErrorCode::RateLimit
    } else {
        match status {
            401 | 403 => {
                if body_text.to_ascii_lowercase().contains("rate limit")
                    || body_text.to_ascii_lowercase().contains("abuse")
                {
                    GitHubErrorCode::Transient
                } else {
                    GitHubErrorCode::Auth
                }
            }
            404 => GitHubErrorCode::NotFound,
            422 => GitHubErrorCode::Validation,
            429 => GitHubErrorCode::RateLimit,
            500..=599 => GitHubErrorCode::Server,
            _ => GitHubErrorCode::Unknown,
        }
    };

    let mut err = GitHubApiError::new(
        format!("github api returned status {status}"),
        code,
    )
    .with_status(status)
    .with_response_text(body_text);
    err.resume_at_ts = resume_at_ts;
    err
}

/// A transient network failure below the HTTP layer (connect/timeout/DNS).
pub fn classify_network_error(message: impl Into<String>) -> GitHubApiError {
    GitHubApiError::new(message, GitHubErrorCode::Network)
}

/// Whether a classified error is worth retrying per the full-jitter backoff policy
/// in [`crate::github::retry`].
pub fn is_retryable(code: &GitHubErrorCode) -> bool {
    matches!(
        code,
        GitHubErrorCode::Server | GitHubErrorCode::Transient | GitHubErrorCode::Network
    )
}
