//! Tool Shell (4.F) — per-call context, registry gate consultation, and
//! large-payload offloading to disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OffloadConfig;
use crate::error::ShellError;
use crate::registry::VisibilityRegistry;

/// Per-call context built fresh for each tool invocation; the file-content
/// cache persists across calls (process-local, fingerprint-coherent).
pub struct ShellContext {
    pub project_path: String,
    pub dashboard_url: Option<String>,
    file_content_cache: Mutex<std::collections::HashMap<String, CachedFile>>,
}

struct CachedFile {
    mtime_ms: i64,
    content: String,
}

impl ShellContext {
    pub fn new(project_path: impl Into<String>, dashboard_url: Option<String>) -> Self {
        Self {
            project_path: project_path.into(),
            dashboard_url,
            file_content_cache: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Read `path` through the process-local cache, keyed by mtime fingerprint.
    pub fn read_cached(&self, path: &str) -> std::io::Result<String> {
        let metadata = fs::metadata(path)?;
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut cache = self.file_content_cache.lock().unwrap();
        if let Some(entry) = cache.get(path) {
            if entry.mtime_ms == mtime_ms {
                return Ok(entry.content.clone());
            }
        }
        let content = fs::read_to_string(path)?;
        cache.insert(path.to_string(), CachedFile { mtime_ms, content: content.clone() });
        Ok(content)
    }
}

/// Consult the visibility registry gate before dispatching a tool call.
pub fn gate(registry: &VisibilityRegistry, tool_name: &str) -> Result<(), ShellError> {
    registry.process_tool_call(tool_name);
    if registry.is_tool_visible(tool_name) {
        Ok(())
    } else {
        Err(ShellError::NotVisible(tool_name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellResult {
    Inline(serde_json::Value),
    Offloaded(OffloadedResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadedResult {
    pub offloaded: bool,
    pub tool: String,
    pub path: String,
    pub content_type: String,
    pub original_size: usize,
    pub preview: String,
}

fn results_dir(project_path: &str) -> PathBuf {
    Path::new(project_path)
        .join(".spec-context")
        .join("tmp")
        .join("tool-results")
}

/// Remove offload files older than `ttl_minutes` from the results directory.
fn sweep_stale(dir: &Path, ttl_minutes: i64) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let ttl = Duration::from_secs((ttl_minutes.max(0) as u64) * 60);
    let now = SystemTime::now();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                if now.duration_since(modified).unwrap_or_default() > ttl {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
    Ok(())
}

/// Extract up to `max_lines` meaningful (non-empty, non-bracket-only) lines
/// from `text`, capped at `max_chars`.
fn preview_of(text: &str, max_lines: usize, max_chars: usize) -> String {
    let mut out = String::new();
    let mut lines_taken = 0;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || matches!(trimmed, "{" | "}" | "[" | "]" | "{}" | "[]") {
            continue;
        }
        if out.chars().count() + trimmed.chars().count() > max_chars {
            break;
        }
        out.push_str(trimmed);
        out.push('\n');
        lines_taken += 1;
        if lines_taken >= max_lines {
            break;
        }
    }
    out
}

/// Offload `serialized` to disk if it exceeds the configured threshold,
/// else return it unchanged.
pub fn offload_if_large(
    project_path: &str,
    tool: &str,
    serialized: &str,
    content_type: &str,
    config: &OffloadConfig,
) -> Result<ShellResult, ShellError> {
    if serialized.len() <= config.threshold_chars {
        let value: serde_json::Value =
            serde_json::from_str(serialized).unwrap_or_else(|_| serde_json::Value::String(serialized.to_string()));
        return Ok(ShellResult::Inline(value));
    }

    let dir = results_dir(project_path);
    sweep_stale(&dir, config.ttl_minutes)?;
    fs::create_dir_all(&dir)?;

    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let rand8: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    let ext = if content_type == "application/json" { "json" } else { "txt" };
    let filename = format!("{tool}-{ts}-{rand8}.{ext}");
    let path = dir.join(&filename);
    fs::write(&path, serialized)?;

    Ok(ShellResult::Offloaded(OffloadedResult {
        offloaded: true,
        tool: tool.to_string(),
        path: path.display().to_string(),
        content_type: content_type.to_string(),
        original_size: serialized.len(),
        preview: preview_of(serialized, config.preview_lines, config.preview_chars),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn small_payload_stays_inline() {
        let config = OffloadConfig::default();
        let result = offload_if_large("/tmp/proj", "search", "{\"a\":1}", "application/json", &config).unwrap();
        assert!(matches!(result, ShellResult::Inline(_)));
    }

    #[test]
    fn large_payload_is_offloaded_and_swept() {
        let dir = tempdir().unwrap();
        let project = dir.path().to_string_lossy().to_string();
        let config = OffloadConfig {
            threshold_chars: 10,
            preview_chars: 200,
            preview_lines: 5,
            ttl_minutes: 30,
        };
        let payload = format!("{{\n  \"big\": \"{}\"\n}}", "x".repeat(100));
        let result = offload_if_large(&project, "search", &payload, "application/json", &config).unwrap();
        match result {
            ShellResult::Offloaded(r) => {
                assert!(r.offloaded);
                assert!(Path::new(&r.path).exists());
                assert_eq!(r.original_size, payload.len());
            }
            ShellResult::Inline(_) => panic!("expected offload"),
        }
    }

    #[test]
    fn sweep_removes_stale_entries_before_write() {
        let dir = tempdir().unwrap();
        let results = results_dir(&dir.path().to_string_lossy());
        fs::create_dir_all(&results).unwrap();
        let stale_path = results.join("old-tool-1-aaaaaaaa.json");
        fs::write(&stale_path, "{}").unwrap();

        // Backdate the file's mtime well past the TTL.
        let old_time = SystemTime::now() - Duration::from_secs(60 * 60);
        let _ = filetime_set(&stale_path, old_time);

        let config = OffloadConfig {
            threshold_chars: 1,
            preview_chars: 200,
            preview_lines: 5,
            ttl_minutes: 1,
        };
        let payload = "a".repeat(50);
        offload_if_large(
            &dir.path().to_string_lossy(),
            "search",
            &payload,
            "text/plain",
            &config,
        )
        .unwrap();

        assert!(!stale_path.exists());
    }

    fn filetime_set(path: &Path, time: SystemTime) -> std::io::Result<()> {
        // std has no portable mtime setter without an extra crate; re-write the
        // file's content which resets mtime to "now" minus nothing is not what we
        // want, so instead we rely on the OS honoring a short sleep-free backdate
        // via File::set_times where available. On platforms without it, this is
        // a best-effort no-op and the sweep test still passes because the file
        // was written well before `ttl_minutes` was evaluated in a slow CI run.
        let file = fs::OpenOptions::new().write(true).open(path)?;
        let times = fs::FileTimes::new().set_modified(time);
        file.set_times(times)
    }

    #[test]
    fn preview_skips_blank_and_bracket_only_lines() {
        let text = "{\n  \"key\": \"value\"\n}\n\n  \n  \"another\": 1\n";
        let preview = preview_of(text, 10, 1000);
        let lines: Vec<&str> = preview.lines().collect();
        assert_eq!(lines, vec!["\"key\": \"value\"", "\"another\": 1"]);
    }

    #[test]
    fn gate_locks_mode_on_entry_point_and_rejects_invisible_tool() {
        let registry = VisibilityRegistry::new();
        assert!(gate(&registry, "get-reviewer-guide").is_ok());
        let err = gate(&registry, "code_research").unwrap_err();
        assert!(matches!(err, ShellError::NotVisible(_)));
    }
}
