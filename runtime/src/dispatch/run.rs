//! Run state and the process-wide run registry.
//!
//! Each run is held behind its own `tokio::sync::Mutex` so that a tool call
//! touching one run never blocks tool calls touching another; the registry
//! itself is a `tokio::sync::RwLock<HashMap<..>>` guarding only insertion.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::DispatchError;
use crate::ledger::{FactStore, ProgressLedger, TaskLedger};

use super::classify::Level;
use super::prompt::GuideState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    AwaitingReview,
    Completed,
    Failed,
}

pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub spec_name: String,
    pub task_id: String,
    pub project_path: String,
    pub goal: String,
    pub classification: Level,
    pub classifier_id: &'static str,
    pub facts: FactStore,
    pub task_ledger: TaskLedger,
    pub progress_ledger: ProgressLedger,
    /// Guide-cache state keyed by role string ("implementer"/"reviewer").
    pub guide_state: HashMap<String, GuideState>,
    pub schema_invalid_counts: HashMap<String, u32>,
}

impl Run {
    pub fn guide_state_for(&mut self, role: &str) -> &mut GuideState {
        self.guide_state.entry(role.to_string()).or_default()
    }

    /// `{run_id, status, goal, facts, task_ledger, progress_ledger}` per `get_snapshot`.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            run_id: self.run_id.clone(),
            status: self.status,
            goal: self.goal.clone(),
            facts: self.facts.all().to_vec(),
            task_ledger: self.task_ledger.clone(),
            progress_ledger: self.progress_ledger.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub goal: String,
    pub facts: Vec<crate::ledger::Fact>,
    pub task_ledger: TaskLedger,
    pub progress_ledger: ProgressLedger,
}

#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<Mutex<Run>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, run: Run) {
        let mut runs = self.runs.write().await;
        runs.insert(run.run_id.clone(), Arc::new(Mutex::new(run)));
    }

    pub async fn get(&self, run_id: &str) -> Result<Arc<Mutex<Run>>, DispatchError> {
        let runs = self.runs.read().await;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| DispatchError::RunNotFound(run_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::progress::{SourceFingerprint, Totals};

    fn sample_run(run_id: &str) -> Run {
        Run {
            run_id: run_id.to_string(),
            status: RunStatus::Initialized,
            spec_name: "widget".to_string(),
            task_id: "1.2".to_string(),
            project_path: "/tmp/project".to_string(),
            goal: "Implement the widget".to_string(),
            classification: Level::Simple,
            classifier_id: "keyword",
            facts: FactStore::new(),
            task_ledger: TaskLedger::new(2),
            progress_ledger: ProgressLedger {
                spec_name: "widget".to_string(),
                task_id: "1.2".to_string(),
                source_path: "tasks.md".to_string(),
                source_fingerprint: SourceFingerprint {
                    mtime_ms: 0,
                    sha256: "x".to_string(),
                },
                totals: Totals {
                    total: 1,
                    completed: 0,
                    in_progress: 1,
                    pending: 0,
                },
                active_task_id: Some("1.2".to_string()),
                current_task: None,
            },
            guide_state: HashMap::new(),
            schema_invalid_counts: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let registry = RunRegistry::new();
        registry.insert(sample_run("run-1")).await;
        let run = registry.get("run-1").await.unwrap();
        let guard = run.lock().await;
        assert_eq!(guard.run_id, "run-1");
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let registry = RunRegistry::new();
        let err = registry.get("nope").await.unwrap_err();
        assert_eq!(err.error_code(), "run_not_initialized");
    }

    #[tokio::test]
    async fn concurrent_runs_do_not_block_each_other() {
        let registry = Arc::new(RunRegistry::new());
        registry.insert(sample_run("a")).await;
        registry.insert(sample_run("b")).await;

        let ra = registry.clone();
        let rb = registry.clone();
        let (ja, jb) = tokio::join!(
            tokio::spawn(async move {
                let run = ra.get("a").await.unwrap();
                let mut guard = run.lock().await;
                guard.goal = "updated a".to_string();
            }),
            tokio::spawn(async move {
                let run = rb.get("b").await.unwrap();
                let mut guard = run.lock().await;
                guard.goal = "updated b".to_string();
            })
        );
        ja.unwrap();
        jb.unwrap();

        assert_eq!(registry.get("a").await.unwrap().lock().await.goal, "updated a");
        assert_eq!(registry.get("b").await.unwrap().lock().await.goal, "updated b");
    }

    #[test]
    fn guide_state_is_created_lazily_per_role() {
        let mut run = sample_run("run-1");
        let _ = run.guide_state_for("implementer");
        assert!(run.guide_state.contains_key("implementer"));
        assert!(!run.guide_state.contains_key("reviewer"));
    }
}
