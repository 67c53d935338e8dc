//! Stable-prefix prompt assembly, hashing, and guide cache-mode tracking.

use crate::hashing::sha256_hex;
use crate::ledger::ProgressLedger;

use super::classify::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuideMode {
    Full,
    Compact,
}

/// Per-`(role, run)` guide-cache bookkeeping: full mode on the first
/// compile, compact from the second compile onward as long as steering
/// content hasn't changed — a change invalidates the compact cache and
/// resets to full.
#[derive(Debug, Clone, Default)]
pub struct GuideState {
    steering_hash: String,
    same_hash_compiles: u32,
}

impl GuideState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, steering_content: &str) -> (GuideMode, String) {
        let hash = sha256_hex(steering_content.as_bytes());
        if hash != self.steering_hash {
            self.steering_hash = hash.clone();
            self.same_hash_compiles = 1;
        } else {
            self.same_hash_compiles += 1;
        }
        let mode = if self.same_hash_compiles >= 2 {
            GuideMode::Compact
        } else {
            GuideMode::Full
        };
        (mode, self.steering_hash.clone())
    }
}

fn system_header(role: Role) -> String {
    match role {
        Role::Implementer => {
            "You are the implementer. Follow the task prompt and the contract below exactly.".to_string()
        }
        Role::Reviewer => {
            "You are the reviewer. Assess the implementer's change against the contract below.".to_string()
        }
    }
}

fn steering_block(steering_tech: &str, steering_principles: &str, mode: GuideMode) -> String {
    match mode {
        GuideMode::Full => format!(
            "## Steering: tech\n{steering_tech}\n\n## Steering: principles\n{steering_principles}\n"
        ),
        GuideMode::Compact => "## Steering (compact)\nUnchanged since last compile; see guide cache key.\n".to_string(),
    }
}

fn progress_summary(ledger: &ProgressLedger) -> String {
    let active = ledger
        .current_task
        .as_ref()
        .map(|t| format!("{} — {}", t.id, t.description))
        .unwrap_or_else(|| "none".to_string());
    format!(
        "## Progress\nTotals: {completed}/{total} completed, {in_progress} in progress, {pending} pending.\nActive task: {active}\n",
        completed = ledger.totals.completed,
        total = ledger.totals.total,
        in_progress = ledger.totals.in_progress,
        pending = ledger.totals.pending,
    )
}

const CONTRACT_BLOCK: &str = "## Output contract\nRespond with exactly one block:\nBEGIN_DISPATCH_RESULT\n{ ...single JSON object... }\nEND_DISPATCH_RESULT\nNo content is permitted before BEGIN_DISPATCH_RESULT or after END_DISPATCH_RESULT.\n";

/// Assemble the stable prefix: system header, steering docs, progress
/// summary, contract block, guide cache key reference. MUST NOT include
/// the task-specific prompt.
pub fn build_stable_prefix(
    role: Role,
    steering_tech: &str,
    steering_principles: &str,
    progress_ledger: &ProgressLedger,
    mode: GuideMode,
    guide_cache_key: &str,
) -> String {
    format!(
        "{header}\n\n{steering}\n{progress}\n{contract}\n## Guide cache key\n{guide_cache_key}\n",
        header = system_header(role),
        steering = steering_block(steering_tech, steering_principles, mode),
        progress = progress_summary(progress_ledger),
        contract = CONTRACT_BLOCK,
    )
}

pub fn build_dynamic_tail(task_prompt: &str) -> String {
    format!("Task prompt:\n{task_prompt}")
}

pub fn stable_prefix_hash(stable_prefix: &str) -> String {
    sha256_hex(stable_prefix.as_bytes())
}

pub fn full_prompt_hash(stable_prefix: &str, dynamic_tail: &str) -> String {
    sha256_hex(format!("{stable_prefix}{dynamic_tail}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::progress::{SourceFingerprint, TaskEntry, TaskStatus, Totals};

    fn sample_ledger() -> ProgressLedger {
        ProgressLedger {
            spec_name: "widget".to_string(),
            task_id: "1.2".to_string(),
            source_path: "tasks.md".to_string(),
            source_fingerprint: SourceFingerprint {
                mtime_ms: 0,
                sha256: "deadbeef".to_string(),
            },
            totals: Totals {
                total: 3,
                completed: 1,
                in_progress: 1,
                pending: 1,
            },
            active_task_id: Some("1.2".to_string()),
            current_task: Some(TaskEntry {
                id: "1.2".to_string(),
                description: "Implement the widget".to_string(),
                status: TaskStatus::InProgress,
                prompt: None,
                requirements: vec![],
            }),
        }
    }

    #[test]
    fn guide_mode_is_full_then_compact() {
        let mut state = GuideState::new();
        let (mode1, _) = state.advance("tech doc v1");
        assert_eq!(mode1, GuideMode::Full);
        let (mode2, _) = state.advance("tech doc v1");
        assert_eq!(mode2, GuideMode::Compact);
    }

    #[test]
    fn steering_change_invalidates_compact_cache() {
        let mut state = GuideState::new();
        state.advance("tech doc v1");
        state.advance("tech doc v1");
        let (mode, _) = state.advance("tech doc v2");
        assert_eq!(mode, GuideMode::Full);
    }

    #[test]
    fn stable_prefix_excludes_task_prompt() {
        let ledger = sample_ledger();
        let prefix = build_stable_prefix(
            Role::Implementer,
            "tech",
            "principles",
            &ledger,
            GuideMode::Full,
            "abc123",
        );
        assert!(!prefix.contains("Task prompt:"));
        assert!(prefix.contains("BEGIN_DISPATCH_RESULT"));
        assert!(prefix.contains("Implement the widget"));
    }

    #[test]
    fn hashes_are_deterministic_and_prefix_stable_across_tails() {
        let ledger = sample_ledger();
        let prefix = build_stable_prefix(
            Role::Implementer,
            "tech",
            "principles",
            &ledger,
            GuideMode::Full,
            "abc123",
        );
        let h1 = stable_prefix_hash(&prefix);
        let h2 = stable_prefix_hash(&prefix);
        assert_eq!(h1, h2);

        let tail_a = build_dynamic_tail("do task A");
        let tail_b = build_dynamic_tail("do task B");
        assert_ne!(
            full_prompt_hash(&prefix, &tail_a),
            full_prompt_hash(&prefix, &tail_b)
        );
        assert_eq!(stable_prefix_hash(&prefix), h1);
    }
}
