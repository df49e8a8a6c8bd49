//! Run metrics and triage (§4.F): parses an agent session's event stream into
//! wall/tool time and quality, aggregates those across a run's sessions, and scores
//! the result for human triage. Pure computation lives in [`events`], [`session`],
//! and [`triage`]; this module is the seam where that computation meets [`crate::store`].

pub mod events;
pub mod session;
pub mod triage;

use std::collections::HashMap;

pub use events::{Event, ParsedEvents, parse_events};
pub use session::{QualityInputs, SessionMetrics, aggregate_run_quality, compute_session_metrics, derive_quality};
pub use triage::{TriageInputs, TriageResult, compute_triage};

use crate::errors::StoreError;
use crate::store::{GateKind, GateStatus, Quality, RunGateResult, RunMetrics, RunStepMetrics, Store};

/// One session's contribution to a run: its metrics plus the quality inputs not
/// derivable from the event stream alone (did this session's token accounting come
/// back complete, etc).
#[derive(Debug, Clone)]
pub struct SessionContribution {
    pub metrics: SessionMetrics,
    pub quality_inputs: QualityInputs,
}

/// Sum a run's sessions into its [`RunMetrics`] row. Wall and tool time sum across
/// sessions (each session is a distinct attempt within the run's lifetime); a burst
/// in any session makes the run's `recent_burst_at_end` true; run quality is the
/// worst session quality, with the whole-run token completeness folded in on top
/// (§4.F "Run aggregation").
pub fn aggregate_run_metrics(run_id: i64, sessions: &[SessionContribution], tokens_complete: bool) -> RunMetrics {
    let mut wall_ms: Option<i64> = None;
    let mut tool_ms: Option<i64> = None;
    let mut anomaly_count = 0i64;
    let mut parse_error_count = 0i64;
    let mut recent_burst_at_end = false;
    let mut qualities = Vec::with_capacity(sessions.len());

    for contribution in sessions {
        wall_ms = Some(wall_ms.unwrap_or(0) + contribution.metrics.wall_ms.unwrap_or(0));
        tool_ms = Some(tool_ms.unwrap_or(0) + contribution.metrics.tool_ms.unwrap_or(0));
        anomaly_count += contribution.metrics.anomaly_count;
        parse_error_count += contribution.quality_inputs.parse_error_count;
        recent_burst_at_end = recent_burst_at_end || contribution.metrics.recent_burst_at_end;
        qualities.push(derive_quality(contribution.quality_inputs));
    }

    let quality = aggregate_run_quality(&qualities, tokens_complete);

    RunMetrics {
        run_id,
        wall_ms,
        tool_ms,
        anomaly_count,
        recent_burst_at_end,
        parse_error_count,
        quality,
    }
}

/// Merge every session's per-step wall time into run-level step metrics rows, one
/// per distinct step title, summing across sessions that visited the same step.
pub fn aggregate_step_metrics(run_id: i64, sessions: &[SessionContribution]) -> Vec<RunStepMetrics> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    for contribution in sessions {
        for (title, wall_ms) in &contribution.metrics.step_wall_ms {
            *totals.entry(title.clone()).or_insert(0) += wall_ms;
        }
    }
    let mut steps: Vec<RunStepMetrics> = totals
        .into_iter()
        .map(|(step_title, wall_ms)| RunStepMetrics { run_id, step_title, wall_ms: Some(wall_ms) })
        .collect();
    steps.sort_by(|a, b| a.step_title.cmp(&b.step_title));
    steps
}

/// Ensure every gate in [`GateKind::ALL`] has a row for this run, then return all of
/// them (§4.F `ensureRalphRunGateRows`).
pub fn ensure_and_fetch_gate_rows(store: &Store, run_id: i64) -> Result<Vec<RunGateResult>, StoreError> {
    store.ensure_gate_rows(run_id)?;
    store.list_gate_results(run_id)
}

/// Reduce every gate result ever recorded against an issue to the single latest
/// result per gate, ties broken by the highest `run_id` (most recently created run
/// wins over a stale re-delivery with an equal `updated_at`). Left to plain Rust
/// rather than a nested SQL query, matching the store layer's "thin store, logic in
/// Rust" shape used elsewhere (§9).
pub fn latest_gate_status_for_issue(results: &[RunGateResult]) -> HashMap<GateKind, RunGateResult> {
    let mut latest: HashMap<GateKind, RunGateResult> = HashMap::new();
    for result in results {
        match latest.get(&result.gate) {
            Some(current)
                if (current.updated_at, current.run_id) >= (result.updated_at, result.run_id) => {}
            _ => {
                latest.insert(result.gate, result.clone());
            }
        }
    }
    latest
}

/// `true` once every tracked gate for an issue has reached [`GateStatus::Pass`].
pub fn all_gates_passing(latest: &HashMap<GateKind, RunGateResult>) -> bool {
    GateKind::ALL
        .iter()
        .all(|gate| matches!(latest.get(gate), Some(result) if result.status == GateStatus::Pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(wall_ms: i64, tool_ms: i64, anomalies: i64, burst: bool, tokens_complete: bool) -> SessionContribution {
        SessionContribution {
            metrics: SessionMetrics {
                wall_ms: Some(wall_ms),
                tool_ms: Some(tool_ms),
                anomaly_count: anomalies,
                recent_burst_at_end: burst,
                step_wall_ms: HashMap::new(),
            },
            quality_inputs: QualityInputs { tokens_complete, ..Default::default() },
        }
    }

    #[test]
    fn aggregate_run_metrics_sums_across_sessions() {
        let sessions = vec![session(1000, 200, 1, false, true), session(500, 100, 0, true, true)];
        let metrics = aggregate_run_metrics(7, &sessions, true);
        assert_eq!(metrics.run_id, 7);
        assert_eq!(metrics.wall_ms, Some(1500));
        assert_eq!(metrics.tool_ms, Some(300));
        assert_eq!(metrics.anomaly_count, 1);
        assert!(metrics.recent_burst_at_end);
        assert_eq!(metrics.quality, Quality::Ok);
    }

    #[test]
    fn aggregate_run_metrics_downgrades_quality_on_incomplete_tokens() {
        let sessions = vec![session(1000, 200, 0, false, true)];
        let metrics = aggregate_run_metrics(1, &sessions, false);
        assert_eq!(metrics.quality, Quality::Partial);
    }

    #[test]
    fn aggregate_step_metrics_sums_same_titled_steps_across_sessions() {
        let mut first = session(100, 0, 0, false, true);
        first.metrics.step_wall_ms.insert("plan".to_string(), 50);
        let mut second = session(100, 0, 0, false, true);
        second.metrics.step_wall_ms.insert("plan".to_string(), 30);
        second.metrics.step_wall_ms.insert("build".to_string(), 70);

        let steps = aggregate_step_metrics(9, &[first, second]);
        let plan = steps.iter().find(|s| s.step_title == "plan").unwrap();
        let build = steps.iter().find(|s| s.step_title == "build").unwrap();
        assert_eq!(plan.wall_ms, Some(80));
        assert_eq!(build.wall_ms, Some(70));
    }

    fn gate_result(run_id: i64, gate: GateKind, status: GateStatus, updated_at: i64) -> RunGateResult {
        RunGateResult { run_id, gate, status, updated_at }
    }

    #[test]
    fn latest_gate_status_picks_the_newest_updated_at() {
        let results = vec![
            gate_result(1, GateKind::Ci, GateStatus::Pending, 100),
            gate_result(2, GateKind::Ci, GateStatus::Pass, 200),
        ];
        let latest = latest_gate_status_for_issue(&results);
        assert_eq!(latest.get(&GateKind::Ci).unwrap().status, GateStatus::Pass);
        assert_eq!(latest.get(&GateKind::Ci).unwrap().run_id, 2);
    }

    #[test]
    fn latest_gate_status_breaks_ties_on_highest_run_id() {
        let results = vec![
            gate_result(1, GateKind::Ci, GateStatus::Fail, 100),
            gate_result(5, GateKind::Ci, GateStatus::Pass, 100),
        ];
        let latest = latest_gate_status_for_issue(&results);
        assert_eq!(latest.get(&GateKind::Ci).unwrap().run_id, 5);
        assert_eq!(latest.get(&GateKind::Ci).unwrap().status, GateStatus::Pass);
    }

    #[test]
    fn all_gates_passing_requires_every_tracked_gate() {
        let mut latest = HashMap::new();
        for gate in GateKind::ALL {
            latest.insert(gate, gate_result(1, gate, GateStatus::Pass, 1));
        }
        assert!(all_gates_passing(&latest));

        latest.insert(GateKind::Review, gate_result(1, GateKind::Review, GateStatus::Pending, 2));
        assert!(!all_gates_passing(&latest));
    }
}
