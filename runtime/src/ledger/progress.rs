//! Progress ledger — a derived, fingerprinted view over a project's
//! `tasks.md` source of truth.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::facts::{Fact, FactStore};
use crate::error::LedgerError;
use crate::hashing::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub prompt: Option<String>,
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub total: u32,
    pub completed: u32,
    pub in_progress: u32,
    pub pending: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFingerprint {
    pub mtime_ms: i64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLedger {
    pub spec_name: String,
    pub task_id: String,
    pub source_path: String,
    pub source_fingerprint: SourceFingerprint,
    pub totals: Totals,
    pub active_task_id: Option<String>,
    pub current_task: Option<TaskEntry>,
}

/// Resolve `{project}/.spec-context/specs/{spec}/tasks.md`.
pub fn tasks_file_path(project_path: &str, spec_name: &str) -> PathBuf {
    Path::new(project_path)
        .join(".spec-context")
        .join("specs")
        .join(spec_name)
        .join("tasks.md")
}

/// Extract the progress ledger for `task_id` from `tasks.md` under `project_path`.
pub fn extract(
    project_path: &str,
    spec_name: &str,
    task_id: &str,
) -> Result<ProgressLedger, LedgerError> {
    let path = tasks_file_path(project_path, spec_name);
    if !path.exists() {
        return Err(LedgerError::MissingTasksFile(path.display().to_string()));
    }
    let content = fs::read_to_string(&path)?;
    let metadata = fs::metadata(&path)?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let entries = parse_task_entries(&content);
    if entries.is_empty() {
        return Err(LedgerError::ParseFailed(path.display().to_string()));
    }

    let totals = totals_of(&entries);
    let active_task_id = entries
        .iter()
        .find(|e| e.status == TaskStatus::InProgress)
        .map(|e| e.id.clone());
    let current_task = entries
        .iter()
        .find(|e| e.id == task_id)
        .cloned()
        .or_else(|| {
            active_task_id
                .as_ref()
                .and_then(|id| entries.iter().find(|e| &e.id == id).cloned())
        });

    Ok(ProgressLedger {
        spec_name: spec_name.to_string(),
        task_id: task_id.to_string(),
        source_path: path.display().to_string(),
        source_fingerprint: SourceFingerprint {
            mtime_ms,
            sha256: sha256_hex(content.as_bytes()),
        },
        totals,
        active_task_id,
        current_task,
    })
}

/// Re-read the source file and compare fingerprints.
pub fn is_stale(ledger: &ProgressLedger) -> Result<bool, LedgerError> {
    let path = Path::new(&ledger.source_path);
    if !path.exists() {
        return Ok(true);
    }
    let content = fs::read_to_string(path)?;
    Ok(sha256_hex(content.as_bytes()) != ledger.source_fingerprint.sha256)
}

fn totals_of(entries: &[TaskEntry]) -> Totals {
    let mut totals = Totals {
        total: entries.len() as u32,
        completed: 0,
        in_progress: 0,
        pending: 0,
    };
    for e in entries {
        match e.status {
            TaskStatus::Completed => totals.completed += 1,
            TaskStatus::InProgress => totals.in_progress += 1,
            TaskStatus::Pending => totals.pending += 1,
        }
    }
    totals
}

/// Parse `- [x] 1.2 Description` / `- [-] ...` / `- [ ] ...` style task
/// markers, plus trailing `_Requirements: ...` and `_Prompt: ...` lines.
fn parse_task_entries(content: &str) -> Vec<TaskEntry> {
    let mut entries = Vec::new();
    let mut current: Option<TaskEntry> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("- [") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            if let Some((marker, tail)) = rest.split_once(']') {
                let status = match marker {
                    "x" | "X" => TaskStatus::Completed,
                    "-" => TaskStatus::InProgress,
                    _ => TaskStatus::Pending,
                };
                let tail = tail.trim();
                let (id, description) = tail
                    .split_once(' ')
                    .map(|(id, rest)| (id.to_string(), rest.trim().to_string()))
                    .unwrap_or_else(|| (tail.to_string(), String::new()));
                current = Some(TaskEntry {
                    id,
                    description,
                    status,
                    prompt: None,
                    requirements: Vec::new(),
                });
            }
        } else if let Some(entry) = current.as_mut() {
            let t = trimmed.trim_start_matches('_').trim();
            if let Some(reqs) = t.strip_prefix("Requirements:") {
                entry.requirements = reqs
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if let Some(prompt) = t.strip_prefix("Prompt:") {
                entry.prompt = Some(prompt.trim().to_string());
            }
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}

const PREFIX: &str = "ledger.progress";

pub fn to_facts(ledger: &ProgressLedger) -> Vec<Fact> {
    vec![
        Fact::new(format!("{PREFIX}.spec_name"), ledger.spec_name.clone(), 1.0),
        Fact::new(format!("{PREFIX}.task_id"), ledger.task_id.clone(), 1.0),
        Fact::new(format!("{PREFIX}.source_path"), ledger.source_path.clone(), 1.0),
        Fact::json(format!("{PREFIX}.source_fingerprint"), &ledger.source_fingerprint, 1.0),
        Fact::json(format!("{PREFIX}.totals"), &ledger.totals, 1.0),
        Fact::new(
            format!("{PREFIX}.active_task_id"),
            ledger.active_task_id.clone().unwrap_or_default(),
            1.0,
        ),
        Fact::json(format!("{PREFIX}.current_task"), &ledger.current_task, 1.0),
    ]
}

pub fn from_facts(store: &FactStore) -> Option<ProgressLedger> {
    let spec_name = store.latest(&format!("{PREFIX}.spec_name"))?.to_string();
    let task_id = store.latest(&format!("{PREFIX}.task_id"))?.to_string();
    let source_path = store.latest(&format!("{PREFIX}.source_path"))?.to_string();
    let source_fingerprint: SourceFingerprint =
        serde_json::from_str(store.latest(&format!("{PREFIX}.source_fingerprint"))?).ok()?;
    let totals: Totals = serde_json::from_str(store.latest(&format!("{PREFIX}.totals"))?).ok()?;
    let active_task_id = store
        .latest(&format!("{PREFIX}.active_task_id"))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let current_task: Option<TaskEntry> =
        serde_json::from_str(store.latest(&format!("{PREFIX}.current_task"))?).ok()?;

    Some(ProgressLedger {
        spec_name,
        task_id,
        source_path,
        source_fingerprint,
        totals,
        active_task_id,
        current_task,
    })
}
