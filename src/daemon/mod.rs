//! Daemon identity (§4.C): the on-disk daemon record and control file, liveness
//! probing, and the `doctor` repair algorithm.
//!
//! Liveness is checked the way the reference daemon checks it — a signal-0 `kill`,
//! which on Unix tells you a pid exists without disturbing it.

pub mod bootstrap;
pub mod run;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::DaemonError;

/// The JSON record a running daemon writes to its control root (§6, wire-exact).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonRecord {
    pub version: u32,
    pub daemon_id: String,
    pub pid: i32,
    pub started_at: String,
    pub heartbeat_at: String,
    pub control_root: PathBuf,
    pub control_file_path: PathBuf,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub ralph_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Running,
    Draining,
    Paused,
}

/// The JSON control file a daemon polls for operator-requested mode changes (§6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub version: u32,
    pub mode: ControlMode,
    pub pause_requested: Option<bool>,
    pub pause_at_checkpoint: Option<String>,
    pub drain_timeout_ms: Option<i64>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            version: 1,
            mode: ControlMode::Running,
            pause_requested: None,
            pause_at_checkpoint: None,
            drain_timeout_ms: None,
        }
    }
}

/// Write `value` to `path` via a temp-file-then-rename so readers never observe a
/// partial write (§5, "files... are replaced via atomic rename").
pub fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DaemonError> {
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| DaemonError::Other(anyhow::anyhow!("failed to serialize {}: {e}", path.display())))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|e| DaemonError::Other(anyhow::anyhow!("failed to create {}: {e}", dir.display())))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
        std::process::id()
    ));
    fs::write(&tmp_path, &body)
        .map_err(|e| DaemonError::Other(anyhow::anyhow!("failed to write {}: {e}", tmp_path.display())))?;
    fs::rename(&tmp_path, path)
        .map_err(|e| DaemonError::Other(anyhow::anyhow!("failed to rename into {}: {e}", path.display())))?;
    Ok(())
}

/// Read the control file at `path`, defaulting to [`ControlState::default`] (mode
/// `running`, no pause/drain requested) when the file is missing or unparseable —
/// a worker should never wedge because an operator hasn't written a control file yet.
pub fn read_control_state(path: &Path) -> ControlState {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// How a daemon record was found to be, after parsing and a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    Live,
    Stale,
    Unreadable,
    Missing,
}

/// How trustworthy the root a candidate record was found under is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootClass {
    TrustedCanonical,
    ManagedLegacy,
    UnsafeTmp,
    Unknown,
}

pub fn classify_root(path: &Path, canonical_root: &Path, managed_legacy_roots: &[PathBuf]) -> RootClass {
    let Some(parent) = path.parent() else {
        return RootClass::Unknown;
    };
    if parent == canonical_root {
        return RootClass::TrustedCanonical;
    }
    if managed_legacy_roots.iter().any(|r| r == parent) {
        return RootClass::ManagedLegacy;
    }
    if parent.starts_with(std::env::temp_dir()) {
        return RootClass::UnsafeTmp;
    }
    RootClass::Unknown
}

/// A daemon record as found on disk, with its classification.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub record: Option<DaemonRecord>,
    pub record_class: RecordClass,
    pub root_class: RootClass,
}

/// Returns `true` iff `pid` identifies a live process, using signal-0 on Unix.
#[cfg(unix)]
pub fn is_pid_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: i32) -> bool {
    false
}

/// Reads `/proc/<pid>/cmdline` and checks whether any of `expected`'s basenames
/// (case-insensitive) appears among the process's argv. On platforms without procfs
/// this can't be verified, so identity is assumed confirmed (liveness alone decides).
#[cfg(target_os = "linux")]
fn verify_command_identity(pid: i32, expected: &[String]) -> bool {
    let Ok(raw) = fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    let argv: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    let basenames: Vec<String> = expected
        .iter()
        .take(3)
        .map(|c| {
            Path::new(c)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(c)
                .to_ascii_lowercase()
        })
        .collect();
    argv.iter().any(|token| {
        let token_base = Path::new(token)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(token)
            .to_ascii_lowercase();
        basenames.contains(&token_base)
    })
}

#[cfg(not(target_os = "linux"))]
fn verify_command_identity(_pid: i32, _expected: &[String]) -> bool {
    true
}

/// Parse and classify a single candidate record path (§4.C).
pub fn classify_candidate(
    path: &Path,
    canonical_root: &Path,
    managed_legacy_roots: &[PathBuf],
) -> Candidate {
    let root_class = classify_root(path, canonical_root, managed_legacy_roots);
    if !path.exists() {
        return Candidate {
            path: path.to_path_buf(),
            record: None,
            record_class: RecordClass::Missing,
            root_class,
        };
    }

    let parsed = fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<DaemonRecord>(&s).ok());

    let Some(record) = parsed else {
        return Candidate {
            path: path.to_path_buf(),
            record: None,
            record_class: RecordClass::Unreadable,
            root_class,
        };
    };

    let alive = is_pid_alive(record.pid) && verify_command_identity(record.pid, &record.command);
    let record_class = if alive { RecordClass::Live } else { RecordClass::Stale };

    Candidate {
        path: path.to_path_buf(),
        record: Some(record),
        record_class,
        root_class,
    }
}

/// Groups live candidates by `(daemonId, pid)`, each group's representative chosen
/// as: canonical-rooted if any, else newest parseable `startedAt`, else
/// lexicographically smallest path (§4.C).
pub fn group_live_candidates(candidates: &[Candidate]) -> Vec<Vec<&Candidate>> {
    let mut groups: HashMap<(String, i32), Vec<&Candidate>> = HashMap::new();
    for c in candidates {
        if c.record_class != RecordClass::Live {
            continue;
        }
        let record = c.record.as_ref().expect("live candidate always has a record");
        groups
            .entry((record.daemon_id.clone(), record.pid))
            .or_default()
            .push(c);
    }
    let mut out: Vec<Vec<&Candidate>> = groups.into_values().collect();
    out.sort_by(|a, b| {
        let da = &a[0].record.as_ref().unwrap().daemon_id;
        let db = &b[0].record.as_ref().unwrap().daemon_id;
        da.cmp(db)
    });
    out
}

pub fn pick_representative<'a>(group: &[&'a Candidate]) -> &'a Candidate {
    if let Some(canonical) = group.iter().find(|c| c.root_class == RootClass::TrustedCanonical) {
        return canonical;
    }
    if let Some(newest) = group
        .iter()
        .filter(|c| c.record.as_ref().map(|r| chrono::DateTime::parse_from_rfc3339(&r.started_at).is_ok()).unwrap_or(false))
        .max_by_key(|c| chrono::DateTime::parse_from_rfc3339(&c.record.as_ref().unwrap().started_at).unwrap())
    {
        return newest;
    }
    group.iter().min_by_key(|c| c.path.clone()).expect("group is non-empty")
}

/// A conflict exists when two or more distinct `(daemonId, pid)` identities are
/// simultaneously live. Doctor reports it; there is no automatic repair.
pub fn has_identity_conflict(groups: &[Vec<&Candidate>]) -> bool {
    groups.len() >= 2
}

/// One finding in a `doctor` report (§6).
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: &'static str,
    pub message: String,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub schema_version: u32,
    pub timestamp: String,
    pub overall_status: &'static str,
    pub findings: Vec<Finding>,
    pub recommended_repairs: Vec<String>,
    pub applied_repairs: Vec<String>,
}

fn quarantine_suffix(kind: &str, pid: Option<i32>, now: &str) -> String {
    let compact_iso = now.replace(['-', ':'], "");
    match pid {
        Some(pid) => format!(".{kind}-{compact_iso}-{pid}"),
        None => format!(".{kind}-{compact_iso}"),
    }
}

/// Rename `path` aside with a quarantine suffix; returns the new path. No-op (and
/// returns `None`) if `path` no longer exists.
pub fn quarantine(path: &Path, kind: &str, pid: Option<i32>, now: &str) -> Option<PathBuf> {
    if !path.exists() {
        return None;
    }
    let suffix = quarantine_suffix(kind, pid, now);
    let mut new_name = path.file_name()?.to_os_string();
    new_name.push(suffix);
    let dest = path.with_file_name(new_name);
    fs::rename(path, &dest).ok()?;
    Some(dest)
}

/// Runs the safe-repairs-only pass over a set of candidate daemon records (§4.C).
/// Read-only by default; pass `apply = true` to perform the quarantine/promotion
/// renames on disk.
pub fn run_doctor(
    candidates: &[Candidate],
    canonical_path: &Path,
    now: &str,
    apply: bool,
) -> DoctorReport {
    let mut findings = Vec::new();
    let mut recommended = Vec::new();
    let mut applied = Vec::new();

    for c in candidates {
        match c.record_class {
            RecordClass::Stale => {
                findings.push(Finding {
                    severity: "warn",
                    message: format!("stale daemon record at {}", c.path.display()),
                    path: Some(c.path.clone()),
                });
                recommended.push(format!("quarantine {}", c.path.display()));
                if apply {
                    if let Some(dest) = quarantine(&c.path, "stale", c.record.as_ref().map(|r| r.pid), now) {
                        applied.push(format!("quarantined {} -> {}", c.path.display(), dest.display()));
                    }
                }
            }
            RecordClass::Unreadable => {
                findings.push(Finding {
                    severity: "warn",
                    message: format!("unreadable daemon record at {}", c.path.display()),
                    path: Some(c.path.clone()),
                });
                recommended.push(format!("quarantine {}", c.path.display()));
                if apply {
                    if let Some(dest) = quarantine(&c.path, "corrupt", None, now) {
                        applied.push(format!("quarantined {} -> {}", c.path.display(), dest.display()));
                    }
                }
            }
            RecordClass::Live if c.root_class == RootClass::UnsafeTmp => {
                findings.push(Finding {
                    severity: "error",
                    message: format!(
                        "live daemon record at {} points outside the canonical control root",
                        c.path.display()
                    ),
                    path: Some(c.path.clone()),
                });
                recommended.push(format!("quarantine unsafe record {}", c.path.display()));
                if apply {
                    if let Some(dest) = quarantine(&c.path, "unsafe", c.record.as_ref().map(|r| r.pid), now) {
                        applied.push(format!("quarantined {} -> {}", c.path.display(), dest.display()));
                    }
                }
            }
            _ => {}
        }
    }

    let groups = group_live_candidates(candidates);
    if has_identity_conflict(&groups) {
        findings.push(Finding {
            severity: "error",
            message: format!("{} distinct live daemon identities detected", groups.len()),
            path: None,
        });
        // No automatic repair for genuine conflicts between distinct identities.
    } else if groups.len() == 1 {
        let group = &groups[0];
        let has_canonical = group.iter().any(|c| c.root_class == RootClass::TrustedCanonical);
        let managed_legacy: Vec<&&Candidate> =
            group.iter().filter(|c| c.root_class == RootClass::ManagedLegacy).collect();

        if !has_canonical && managed_legacy.len() == 1 {
            let legacy = managed_legacy[0];
            let record = legacy.record.as_ref().expect("live candidate has a record");
            if record.control_root == canonical_path.parent().unwrap_or(canonical_path) {
                recommended.push(format!("promote {} to canonical", legacy.path.display()));
                if apply {
                    if fs::copy(&legacy.path, canonical_path).is_ok() {
                        applied.push(format!(
                            "promoted {} to canonical at {}",
                            legacy.path.display(),
                            canonical_path.display()
                        ));
                    }
                }
            }
        }

        if group.len() > 1 {
            let representative = pick_representative(group);
            for c in group.iter() {
                if c.path != representative.path {
                    findings.push(Finding {
                        severity: "warn",
                        message: format!("duplicate live daemon record at {}", c.path.display()),
                        path: Some(c.path.clone()),
                    });
                    recommended.push(format!("quarantine duplicate {}", c.path.display()));
                    if apply {
                        if let Some(dest) =
                            quarantine(&c.path, "duplicate", c.record.as_ref().map(|r| r.pid), now)
                        {
                            applied.push(format!("quarantined {} -> {}", c.path.display(), dest.display()));
                        }
                    }
                }
            }
        }
    }

    let overall_status = if findings.iter().any(|f| f.severity == "error") {
        "error"
    } else if !findings.is_empty() {
        "warn"
    } else {
        "ok"
    };

    DoctorReport {
        schema_version: 1,
        timestamp: now.to_string(),
        overall_status,
        findings,
        recommended_repairs: recommended,
        applied_repairs: applied,
    }
}

/// Quarantine a legacy control file that exactly matches the canonical control
/// file's content shape (§4.C). Only safe when no live daemon references it.
pub fn quarantine_matching_legacy_control_file(
    legacy_path: &Path,
    canonical: &ControlState,
    referenced_by_live: bool,
    now: &str,
) -> Option<PathBuf> {
    if referenced_by_live {
        return None;
    }
    let legacy: ControlState = fs::read_to_string(legacy_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())?;
    if &legacy != canonical {
        return None;
    }
    quarantine(legacy_path, "legacy", None, now)
}
