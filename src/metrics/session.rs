//! Per-session metric computation (§4.F): wall/tool time, per-step wall time,
//! anomaly bursts, and quality derivation/ranking.

use std::collections::HashMap;

use crate::metrics::events::Event;
use crate::store::Quality;

/// Threshold for a "recent burst": this many anomalies within the trailing window
/// of a run counts as one (§4.F).
const BURST_ANOMALY_THRESHOLD: usize = 20;
const BURST_WINDOW_MS: i64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMetrics {
    pub wall_ms: Option<i64>,
    pub tool_ms: Option<i64>,
    pub anomaly_count: i64,
    pub recent_burst_at_end: bool,
    pub step_wall_ms: HashMap<String, i64>,
}

/// Compute wall/tool/anomaly/per-step metrics from a session's parsed event stream.
/// Events are assumed already in file order (§5: "parsed in file order").
pub fn compute_session_metrics(events: &[Event]) -> SessionMetrics {
    let mut first_run_start: Option<i64> = None;
    let mut last_run_end: Option<i64> = None;
    let mut last_ts: Option<i64> = None;
    let mut tool_starts: HashMap<String, i64> = HashMap::new();
    let mut tool_ms_total: i64 = 0;
    let mut anomaly_ts: Vec<i64> = Vec::new();
    let mut step_starts: Vec<(i64, String)> = Vec::new();

    for event in events {
        last_ts = Some(event.ts());
        match event {
            Event::RunStart { ts, .. } => {
                first_run_start.get_or_insert(*ts);
            }
            Event::StepStart { ts, title, .. } => step_starts.push((*ts, title.clone())),
            Event::RunEnd { ts, .. } => last_run_end = Some(*ts),
            Event::ToolStart { ts, call_id, .. } => {
                tool_starts.insert(call_id.clone(), *ts);
            }
            Event::ToolEnd { ts, call_id, .. } => {
                if let Some(start) = tool_starts.remove(call_id) {
                    tool_ms_total += ts - start;
                }
            }
            Event::Anomaly { ts } => anomaly_ts.push(*ts),
        }
    }

    let run_end_or_last = last_run_end.or(last_ts);
    let wall_ms = match (first_run_start, run_end_or_last) {
        (Some(start), Some(end)) => Some(end - start),
        _ => None,
    };

    let recent_burst_at_end = match run_end_or_last {
        Some(end) => {
            anomaly_ts.iter().filter(|t| end - **t <= BURST_WINDOW_MS).count() >= BURST_ANOMALY_THRESHOLD
        }
        None => false,
    };

    let mut step_wall_ms = HashMap::new();
    for pair in step_starts.windows(2) {
        let (start_ts, title) = &pair[0];
        let (next_ts, _) = &pair[1];
        step_wall_ms.insert(title.clone(), next_ts - start_ts);
    }
    if let (Some((last_step_ts, last_title)), Some(end)) = (step_starts.last(), run_end_or_last) {
        step_wall_ms.entry(last_title.clone()).or_insert(end - last_step_ts);
    }

    SessionMetrics {
        wall_ms,
        tool_ms: Some(tool_ms_total),
        anomaly_count: anomaly_ts.len() as i64,
        recent_burst_at_end,
        step_wall_ms,
    }
}

/// Inputs a quality-affecting factor can come from, beyond what the event stream
/// itself reveals (§4.F).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualityInputs {
    pub missing: bool,
    pub too_large: bool,
    pub timed_out: bool,
    pub error: bool,
    pub parse_error_count: i64,
    pub tokens_complete: bool,
}

/// Derive a session's quality: each worse state overrides a better one, ranked
/// `ok < partial < missing < too_large < timeout < error` (§4.F).
pub fn derive_quality(inputs: QualityInputs) -> Quality {
    let mut quality = Quality::Ok;
    if inputs.parse_error_count > 0 || !inputs.tokens_complete {
        quality = quality.max(Quality::Partial);
    }
    if inputs.missing {
        quality = quality.max(Quality::Missing);
    }
    if inputs.too_large {
        quality = quality.max(Quality::TooLarge);
    }
    if inputs.timed_out {
        quality = quality.max(Quality::Timeout);
    }
    if inputs.error {
        quality = quality.max(Quality::Error);
    }
    quality
}

/// Aggregate several sessions' qualities into a run quality: the worst of the
/// sessions, downgraded to at least `partial` when token accounting is incomplete
/// (§4.F "Run aggregation").
pub fn aggregate_run_quality(session_qualities: &[Quality], tokens_complete: bool) -> Quality {
    let worst = session_qualities.iter().copied().max().unwrap_or(Quality::Ok);
    if !tokens_complete {
        worst.max(Quality::Partial)
    } else {
        worst
    }
}
