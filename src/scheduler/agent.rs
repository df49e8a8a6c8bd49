//! External agent subprocess invocation (§4.G). Spawns the configured agent
//! command per stage, pipes the stage prompt over stdin, and races its exit against
//! the guardrail watchdog. Grounded on the teacher's `ClaudeRunner::run_iteration`
//! (`orchestrator/runner.rs`): piped stdin/stdout, a ticking background task
//! alongside the child, `child.wait()` for the exit code — generalized from a
//! fixed `claude` binary and UI-elapsed-time reporting to a configurable command and
//! a wall-time/tool-call guardrail kill.
//!
//! The agent's own behavioral stream (what it did, how many tool calls) is not on
//! stdout in this system — it's the newline-delimited event file described in
//! §4.F, written to a path the caller computes from the session ID. The watchdog
//! here only tails that file to evaluate the tool-call guardrail; stdout/stderr are
//! drained (and captured for diagnostics) without being parsed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::errors::SchedulerError;
use crate::metrics::events::parse_events;
use crate::scheduler::guardrail::{self, GuardrailLimits, GuardrailOutcome, GuardrailSample};

/// Everything needed to invoke the agent for one stage of one task.
#[derive(Debug, Clone)]
pub struct AgentInvocationSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub prompt: String,
    pub events_path: PathBuf,
    pub step_key: String,
}

/// What kind of guardrail fired, matching the wire shape of `guardrailTimeout` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailKind {
    WallTime,
    ToolChurn,
}

impl GuardrailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailKind::WallTime => "wall-time",
            GuardrailKind::ToolChurn => "tool-churn",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentInvocationOutcome {
    pub exit_code: Option<i32>,
    pub guardrail_kill: Option<GuardrailKind>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl AgentInvocationOutcome {
    pub fn guardrail_killed(&self) -> bool {
        self.guardrail_kill.is_some()
    }
}

/// Capability interface for spawning the external agent, so the claim loop can be
/// driven in tests against a fake without touching a real subprocess (§9 "express
/// each subsystem's collaborators as explicit capability interfaces").
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn invoke(
        &self,
        spec: &AgentInvocationSpec,
        limits: GuardrailLimits,
    ) -> Result<AgentInvocationOutcome, SchedulerError>;
}

/// How often the watchdog samples elapsed time and tails the events file.
const GUARDRAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ProcessAgentRunner;

impl ProcessAgentRunner {
    pub fn new() -> Self {
        Self
    }

    fn count_tool_calls(events_path: &std::path::Path) -> u32 {
        let Ok(content) = std::fs::read_to_string(events_path) else {
            return 0;
        };
        parse_events(&content)
            .events
            .iter()
            .filter(|e| matches!(e, crate::metrics::events::Event::ToolStart { .. }))
            .count() as u32
    }

    async fn drain_tail(mut reader: impl tokio::io::AsyncRead + Unpin, cap: usize) -> String {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf).await;
        let text = String::from_utf8_lossy(&buf).into_owned();
        if text.len() > cap {
            text[text.len() - cap..].to_string()
        } else {
            text
        }
    }

    async fn kill(child: &mut Child) {
        let _ = child.kill().await;
    }
}

impl Default for ProcessAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn invoke(
        &self,
        spec: &AgentInvocationSpec,
        limits: GuardrailLimits,
    ) -> Result<AgentInvocationOutcome, SchedulerError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env("RALPH_STEP_KEY", &spec.step_key)
            .env("RALPH_EVENTS_PATH", &spec.events_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(SchedulerError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(spec.prompt.as_bytes())
                .await
                .map_err(SchedulerError::SpawnFailed)?;
            stdin.shutdown().await.map_err(SchedulerError::SpawnFailed)?;
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let start = Instant::now();
        let mut guardrail_kill = None;

        loop {
            let poll = tokio::time::sleep(GUARDRAIL_POLL_INTERVAL);
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(SchedulerError::SpawnFailed)?;
                    let stdout_tail = match stdout {
                        Some(s) => Self::drain_tail(s, 4_096).await,
                        None => String::new(),
                    };
                    let stderr_tail = match stderr {
                        Some(s) => Self::drain_tail(s, 4_096).await,
                        None => String::new(),
                    };
                    return Ok(AgentInvocationOutcome {
                        exit_code: status.code(),
                        guardrail_kill,
                        stdout_tail,
                        stderr_tail,
                    });
                }
                _ = poll => {
                    let sample = GuardrailSample {
                        elapsed_ms: start.elapsed().as_millis() as u64,
                        tool_calls: Self::count_tool_calls(&spec.events_path),
                    };
                    if guardrail::evaluate(sample, &limits) == GuardrailOutcome::HardBreach {
                        let kind = if sample.elapsed_ms >= limits.wall_hard_ms {
                            GuardrailKind::WallTime
                        } else {
                            GuardrailKind::ToolChurn
                        };
                        Self::kill(&mut child).await;
                        guardrail_kill = Some(kind);
                    }
                }
            }
        }
    }
}
