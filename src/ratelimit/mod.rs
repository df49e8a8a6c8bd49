//! Rate-limit plan derivation, per-issue write coalescing, and per-repo label-write
//! backoff (§4.I). Kept as a single small module since all three are thin wrappers
//! around the same `DashMap`-keyed-registry idiom the re-architecture notes (§9)
//! call out for "promise-coalescing maps".

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::errors::GitHubApiError;
use crate::github::error::derive_resume_at_ts;
use crate::store::cursors::LabelWriteState;

/// A resume-at plan derived from a classified GitHub error, per §4.I.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPlan {
    pub resume_at_ts: i64,
    pub kind: &'static str,
}

/// Turn a [`GitHubApiError`] into a resume plan, or `None` when it isn't a
/// rate-limit event at all. Delegates to the same header/body-timestamp derivation
/// the transport layer already performs, so both entry points agree.
pub fn plan_from_error(err: &GitHubApiError) -> Option<RateLimitPlan> {
    let resume_at_ts = err.resume_at_ts.or_else(|| {
        let headers: HashMap<String, String> = HashMap::new();
        derive_resume_at_ts(&headers, err.response_text.as_deref().unwrap_or(""))
    })?;
    Some(RateLimitPlan {
        resume_at_ts,
        kind: "github-rate-limit",
    })
}

/// Coalesces concurrent label-mutation requests for the same `(repo, issue_number)`
/// within a configurable window: the first caller performs the write, later callers
/// within the window await the same [`Notify`] and observe the same cached outcome
/// rather than firing a second network request.
pub struct Coalescer {
    window: std::time::Duration,
    in_flight: DashMap<(String, i64), Arc<InFlight>>,
}

struct InFlight {
    notify: Notify,
    outcome: std::sync::Mutex<Option<Result<(), String>>>,
}

impl Coalescer {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window,
            in_flight: DashMap::new(),
        }
    }

    /// Run `op` for `(repo, issue_number)`, coalescing with any call already in
    /// flight for the same key. All coalesced callers resolve with the same outcome.
    pub async fn run<F, Fut>(&self, repo: &str, issue_number: i64, op: F) -> Result<(), String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let key = (repo.to_string(), issue_number);

        if let Some(existing) = self.in_flight.get(&key) {
            let existing = existing.clone();
            existing.notify.notified().await;
            return existing.outcome.lock().expect("in-flight mutex poisoned").clone().unwrap();
        }

        let slot = Arc::new(InFlight {
            notify: Notify::new(),
            outcome: std::sync::Mutex::new(None),
        });
        self.in_flight.insert(key.clone(), slot.clone());

        // Give coalescing callers a chance to arrive within the window before the
        // leader's op() resolves and the slot is torn down.
        tokio::time::sleep(self.window).await;

        let outcome = op().await;
        *slot.outcome.lock().expect("in-flight mutex poisoned") = Some(outcome.clone());
        self.in_flight.remove(&key);
        slot.notify.notify_waiters();
        outcome
    }
}

/// Per-repo circuit breaker guarding label writes specifically: these are the most
/// abuse-prone path, so they get their own blocked-until window separate from the
/// global rate-limit plan.
pub struct LabelWriteBackoff<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> LabelWriteBackoff<'a> {
    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    pub fn can_attempt(&self, repo: &str, now_ms: i64) -> Result<bool, crate::errors::StoreError> {
        let state = crate::store::cursors::get_label_write_state(self.conn, repo)?;
        Ok(match state.blocked_until_ms {
            Some(until) => now_ms >= until,
            None => true,
        })
    }

    pub fn record_failure(
        &self,
        repo: &str,
        blocked_until_ms: i64,
        error: &str,
    ) -> Result<(), crate::errors::StoreError> {
        crate::store::cursors::set_label_write_state(
            self.conn,
            repo,
            &LabelWriteState {
                blocked_until_ms: Some(blocked_until_ms),
                last_error: Some(error.to_string()),
            },
        )
    }

    pub fn record_success(&self, repo: &str) -> Result<(), crate::errors::StoreError> {
        crate::store::cursors::set_label_write_state(
            self.conn,
            repo,
            &LabelWriteState {
                blocked_until_ms: None,
                last_error: None,
            },
        )
    }
}
