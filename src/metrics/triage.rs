//! Triage scoring (§4.F): a 0-100 score combining normalized signals from a run's
//! metrics, meant to surface runs worth a human's attention without demanding one
//! look at every run.

/// Weights sum to 100; each term contributes its normalized [0,1] signal times its weight.
const WEIGHT_TOKENS: f64 = 25.0;
const WEIGHT_TOOL_CALLS: f64 = 20.0;
const WEIGHT_ANOMALIES: f64 = 20.0;
const WEIGHT_BURST_BONUS: f64 = 10.0;
const WEIGHT_WALL_HOURS: f64 = 15.0;
const WEIGHT_MAX_STEP_WALL: f64 = 10.0;

/// Extra penalty added when a run did not succeed and burned a non-trivial amount
/// of tokens doing it — a failed run at 50k+ tokens is worth a closer look than a
/// failed run that errored out in the first few calls.
const FAILURE_HIGH_TOKEN_PENALTY: f64 = 15.0;
const FAILURE_HIGH_TOKEN_THRESHOLD: i64 = 50_000;

/// Thresholds used only to decide which human-readable reasons to report, not to
/// compute the score itself.
const HIGH_TOKEN_REASON_THRESHOLD: i64 = 100_000;
const HIGH_TOOL_CALL_REASON_THRESHOLD: i64 = 200;
const HIGH_ANOMALY_REASON_THRESHOLD: i64 = 5;
const HIGH_WALL_HOURS_REASON_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriageInputs {
    pub total_tokens: i64,
    pub tool_call_count: i64,
    pub anomaly_count: i64,
    pub recent_burst_at_end: bool,
    pub wall_ms: i64,
    pub max_step_wall_ms: i64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriageResult {
    pub score: f64,
    pub reasons: Vec<String>,
}

fn normalize_log(value: i64, scale: f64) -> f64 {
    if value <= 0 {
        return 0.0;
    }
    (((value as f64).ln() + 1.0) / scale).min(1.0)
}

/// Compute a run's triage score and the reasons that contributed to it.
/// Normalization uses a log scale for counts (tokens, tool calls) since these
/// signals span several orders of magnitude, and a linear scale (capped at 1.0)
/// for wall-clock durations.
pub fn compute_triage(inputs: TriageInputs) -> TriageResult {
    let tokens_norm = normalize_log(inputs.total_tokens, 12.0);
    let tool_calls_norm = normalize_log(inputs.tool_call_count, 6.0);
    let anomalies_norm = normalize_log(inputs.anomaly_count, 4.0);
    let wall_hours = inputs.wall_ms as f64 / 3_600_000.0;
    let wall_hours_norm = (wall_hours / 4.0).min(1.0);
    let max_step_wall_norm = (inputs.max_step_wall_ms as f64 / 3_600_000.0).min(1.0);

    let mut score = tokens_norm * WEIGHT_TOKENS
        + tool_calls_norm * WEIGHT_TOOL_CALLS
        + anomalies_norm * WEIGHT_ANOMALIES
        + wall_hours_norm * WEIGHT_WALL_HOURS
        + max_step_wall_norm * WEIGHT_MAX_STEP_WALL;

    if inputs.recent_burst_at_end {
        score += WEIGHT_BURST_BONUS;
    }

    if !inputs.succeeded && inputs.total_tokens >= FAILURE_HIGH_TOKEN_THRESHOLD {
        score += FAILURE_HIGH_TOKEN_PENALTY;
    }

    let score = score.clamp(0.0, 100.0);

    let mut reasons = Vec::new();
    if inputs.total_tokens >= HIGH_TOKEN_REASON_THRESHOLD {
        reasons.push(format!("token usage {} at or above {}", inputs.total_tokens, HIGH_TOKEN_REASON_THRESHOLD));
    }
    if inputs.tool_call_count >= HIGH_TOOL_CALL_REASON_THRESHOLD {
        reasons.push(format!("tool call count {} at or above {}", inputs.tool_call_count, HIGH_TOOL_CALL_REASON_THRESHOLD));
    }
    if inputs.anomaly_count >= HIGH_ANOMALY_REASON_THRESHOLD {
        reasons.push(format!("anomaly count {} at or above {}", inputs.anomaly_count, HIGH_ANOMALY_REASON_THRESHOLD));
    }
    if inputs.recent_burst_at_end {
        reasons.push("anomaly burst near run end".to_string());
    }
    if wall_hours >= HIGH_WALL_HOURS_REASON_THRESHOLD {
        reasons.push(format!("wall time {:.1}h at or above {:.1}h", wall_hours, HIGH_WALL_HOURS_REASON_THRESHOLD));
    }
    if !inputs.succeeded && inputs.total_tokens >= FAILURE_HIGH_TOKEN_THRESHOLD {
        reasons.push(format!("run did not succeed after spending {} tokens", inputs.total_tokens));
    }

    TriageResult { score, reasons }
}
