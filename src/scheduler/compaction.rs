//! Context-compaction retry (§4.G): a stage invocation can signal that the agent
//! ran out of context mid-task rather than simply failing. When that happens the
//! worker instructs the same session to compact, then resumes the stage with a
//! prompt rebuilt around the task's plan path and current git status instead of
//! replaying the exhausted conversation.

use std::path::Path;
use std::process::Command;

use crate::store::models::Task;

const CONTEXT_EXHAUSTED_MARKER: &str = "RALPH_CONTEXT_EXHAUSTED";

/// Whether a stage's stdout/stderr signaled a context-exhaustion rather than an
/// ordinary failure. Agents are expected to emit the stable marker token; a
/// case-insensitive free-text fallback covers agents that only describe it in
/// prose.
pub fn is_context_exhausted(stdout_tail: &str, stderr_tail: &str) -> bool {
    let combined = format!("{stdout_tail}\n{stderr_tail}");
    combined.contains(CONTEXT_EXHAUSTED_MARKER) || combined.to_lowercase().contains("context window exhausted")
}

/// The instruction sent to the existing agent session asking it to compact before
/// the stage resumes.
pub fn compact_instruction() -> &'static str {
    "Your context window is exhausted. Summarize the work completed on this task so far, \
     then stop without taking any further action."
}

/// Best-effort `git status --short` for `cwd`; empty if the worktree is unreadable
/// or not a git repo. Never fails the retry path.
fn git_status_short(cwd: &Path) -> String {
    Command::new("git")
        .arg("status")
        .arg("--short")
        .current_dir(cwd)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Rebuild a stage prompt after compaction: the original prompt plus the task's
/// plan path and current git status, so the agent can reorient without the
/// compacted conversation (§4.G "resumes with a rebuilt prompt referencing the plan
/// path and current git status").
pub fn rebuild_prompt(original_prompt: &str, task: &Task, worktree: &Path) -> String {
    let status = git_status_short(worktree);
    format!(
        "{original_prompt}\n\nYour context was just compacted. Plan path: {plan_path}. Current git status:\n{status}",
        plan_path = task.task_path,
        status = if status.is_empty() { "(clean)".to_string() } else { status },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::TaskStatus;

    fn task() -> Task {
        Task {
            repo: "acme/widgets".into(),
            issue_number: 1,
            task_path: "tasks/1.md".into(),
            status: TaskStatus::InProgress,
            session_id: None,
            worker_id: None,
            repo_slot: None,
            daemon_id: None,
            heartbeat_at: None,
            worktree_path: None,
            checkpoint: None,
            checkpoint_seq: 0,
            pause_requested: false,
            paused_at_checkpoint: None,
            blocked_source: None,
            resume_at: None,
            watchdog_retries: 0,
        }
    }

    #[test]
    fn detects_marker_token() {
        assert!(is_context_exhausted("working...\nRALPH_CONTEXT_EXHAUSTED\n", ""));
    }

    #[test]
    fn detects_free_text_variant_case_insensitively() {
        assert!(is_context_exhausted("", "Context Window Exhausted, stopping."));
    }

    #[test]
    fn ordinary_output_is_not_exhausted() {
        assert!(!is_context_exhausted("build succeeded", ""));
    }

    #[test]
    fn rebuild_prompt_includes_plan_path_and_falls_back_on_missing_worktree() {
        let prompt = rebuild_prompt("do the thing", &task(), Path::new("/tmp/definitely-not-a-repo-xyz"));
        assert!(prompt.contains("tasks/1.md"));
        assert!(prompt.contains("(clean)"));
    }
}
