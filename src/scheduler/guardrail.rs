//! Wall-time and tool-call guardrails (§4.G). Soft limits ask the running agent to
//! wrap up; hard limits kill the subprocess outright. Pure decision functions here,
//! the actual `SIGKILL` lives in [`super::agent`].

use std::time::Duration;

use crate::config::RalphConfig;

/// A running invocation's guardrail-relevant counters, sampled on each metrics tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardrailSample {
    pub elapsed_ms: u64,
    pub tool_calls: u32,
}

/// The guardrail verdict for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailOutcome {
    Ok,
    /// Soft threshold crossed: the agent should be asked (not forced) to finish up.
    SoftBreach,
    /// Hard threshold crossed: the invocation must be killed.
    HardBreach,
}

#[derive(Debug, Clone, Copy)]
pub struct GuardrailLimits {
    pub wall_soft_ms: u64,
    pub wall_hard_ms: u64,
    pub tool_calls_soft: u32,
    pub tool_calls_hard: u32,
}

impl GuardrailLimits {
    pub fn from_config(config: &RalphConfig) -> Self {
        Self {
            wall_soft_ms: config.wall_soft_ms,
            wall_hard_ms: config.wall_hard_ms,
            tool_calls_soft: config.tool_calls_soft,
            tool_calls_hard: config.tool_calls_hard,
        }
    }
}

/// Evaluate a sample against the configured limits. Hard breaches take priority
/// over soft ones; either dimension (wall-time, tool calls) crossing its hard limit
/// is enough to kill the invocation (§4.G).
pub fn evaluate(sample: GuardrailSample, limits: &GuardrailLimits) -> GuardrailOutcome {
    if sample.elapsed_ms >= limits.wall_hard_ms || sample.tool_calls >= limits.tool_calls_hard {
        return GuardrailOutcome::HardBreach;
    }
    if sample.elapsed_ms >= limits.wall_soft_ms || sample.tool_calls >= limits.tool_calls_soft {
        return GuardrailOutcome::SoftBreach;
    }
    GuardrailOutcome::Ok
}

/// Required-checks polling backoff (§4.G, §9 open-question 3): starts at
/// `base`, multiplies by `multiplier` on every consecutive miss, caps at `max`,
/// and resets to `base` the moment the check signature changes (a new run started,
/// or the set of required checks itself changed).
pub fn required_checks_backoff(base: Duration, multiplier: f64, max: Duration, consecutive_misses: u32) -> Duration {
    let scaled = base.as_secs_f64() * multiplier.powi(consecutive_misses as i32);
    Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
}
