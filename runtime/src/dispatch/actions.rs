//! The four dispatch runtime operations: `init_run`, `compile_prompt`,
//! `ingest_output`, `get_snapshot`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compaction::{self, Stage, TraceEntry};
use crate::config::Config;
use crate::error::DispatchError;
use crate::ledger::facts::{Fact, FactStore};
use crate::ledger::task::{
    self, ImplementerStatus, Outcome, ReviewerAssessment, ReviewerIssue, TaskLedger,
};
use crate::ledger::progress;

use super::classify::{self, KeywordClassifier, Level, Role, RoutingDecision};
use super::prompt::{self, GuideMode};
use super::run::{Run, RunRegistry, RunStatus, Snapshot};

const DEFAULT_PROMPT_TOKEN_BUDGET: u32 = 6_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub classification: Level,
    pub classifier_id: String,
    pub routing: String,
}

pub async fn init_run(
    registry: &RunRegistry,
    config: &Config,
    run_id: &str,
    spec_name: &str,
    task_id: &str,
    project_path: &str,
) -> Result<InitRunResult, DispatchError> {
    let progress_ledger = progress::extract(project_path, spec_name, task_id)?;

    let goal = progress_ledger
        .current_task
        .as_ref()
        .map(|t| t.description.clone())
        .unwrap_or_else(|| format!("Complete task {task_id}"));

    let (classification, classifier_id) = classify::classify_with_fallback(&KeywordClassifier, &goal);
    let routing = classify::route(Role::Implementer, classification, config);

    let mut facts = FactStore::new();
    facts.push(Fact::new("goal", goal.clone(), 1.0));
    facts.push(Fact::json("classification", &classification, 1.0));
    facts.push(Fact::new("classifier_id", classifier_id, 1.0));
    facts.push(Fact::new("selected_provider", routing.provider.clone(), 1.0));
    facts.push(Fact::new("dispatch_cli", routing.dispatch_cli.clone(), 1.0));
    facts.extend(progress::to_facts(&progress_ledger));

    let run = Run {
        run_id: run_id.to_string(),
        status: RunStatus::Initialized,
        spec_name: spec_name.to_string(),
        task_id: task_id.to_string(),
        project_path: project_path.to_string(),
        goal,
        classification,
        classifier_id,
        facts,
        task_ledger: TaskLedger::new(config.stalled_threshold),
        progress_ledger,
        guide_state: Default::default(),
        schema_invalid_counts: Default::default(),
    };
    registry.insert(run).await;

    Ok(InitRunResult {
        run_id: run_id.to_string(),
        status: RunStatus::Initialized,
        classification,
        classifier_id: classifier_id.to_string(),
        routing: routing.dispatch_cli,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPrompt {
    pub prompt: String,
    pub stable_prefix_hash: String,
    pub full_prompt_hash: String,
    pub prompt_tokens_before: u32,
    pub prompt_tokens_after: u32,
    pub prompt_token_budget: u32,
    pub compaction_applied: bool,
    pub compaction_stage: Option<Stage>,
    pub compaction_trace: Vec<TraceEntry>,
    pub guide_mode: GuideMode,
    pub guide_cache_key: String,
    pub delta_packet: Option<String>,
    pub dispatch_cli: String,
    pub max_output_tokens: u32,
}

fn read_steering(project_path: &str, name: &str) -> String {
    let path = Path::new(project_path)
        .join(".spec-context")
        .join("steering")
        .join(format!("{name}.md"));
    fs::read_to_string(path).unwrap_or_default()
}

fn delta_packet_for(ledger: &TaskLedger) -> Option<String> {
    if ledger.blockers.is_empty() && ledger.required_fixes.is_empty() {
        return None;
    }
    Some(format!(
        "Outstanding blockers: {}. Required fixes: {}.",
        ledger.blockers.join("; "),
        ledger.required_fixes.join("; ")
    ))
}

#[allow(clippy::too_many_arguments)]
pub async fn compile_prompt(
    registry: &RunRegistry,
    config: &Config,
    run_id: &str,
    role: Role,
    task_id: &str,
    task_prompt: &str,
    max_output_tokens: u32,
    compaction_auto: bool,
    compaction_context: &[String],
) -> Result<CompiledPrompt, DispatchError> {
    let run_lock = registry.get(run_id).await?;
    let mut run = run_lock.lock().await;

    if run.task_id != task_id {
        return Err(DispatchError::RunTaskMismatch {
            run_id: run_id.to_string(),
            expected: run.task_id.clone(),
            given: task_id.to_string(),
        });
    }

    let steering_tech = read_steering(&run.project_path, "tech");
    let steering_principles = read_steering(&run.project_path, "principles");
    let steering_combined = format!("{steering_tech}\n{steering_principles}");

    let (guide_mode, guide_cache_key) = run.guide_state_for(role.as_str()).advance(&steering_combined);

    let mut stable_prefix = prompt::build_stable_prefix(
        role,
        &steering_tech,
        &steering_principles,
        &run.progress_ledger,
        guide_mode,
        &guide_cache_key,
    );
    for extra in compaction_context {
        stable_prefix.push_str("\n## Additional context\n");
        stable_prefix.push_str(extra);
        stable_prefix.push('\n');
    }

    let dynamic_tail = prompt::build_dynamic_tail(task_prompt);
    let stable_prefix_hash = prompt::stable_prefix_hash(&stable_prefix);
    let full_prompt_hash = prompt::full_prompt_hash(&stable_prefix, &dynamic_tail);

    let full_prompt = format!("{stable_prefix}\n{dynamic_tail}");
    let budget = DEFAULT_PROMPT_TOKEN_BUDGET;
    let tokens_before = compaction::estimate_tokens(&full_prompt, compaction::DEFAULT_CHARS_PER_TOKEN);

    let routing = classify::route(role, run.classification, config);

    if tokens_before <= budget {
        return Ok(CompiledPrompt {
            prompt: full_prompt,
            stable_prefix_hash,
            full_prompt_hash,
            prompt_tokens_before: tokens_before,
            prompt_tokens_after: tokens_before,
            prompt_token_budget: budget,
            compaction_applied: false,
            compaction_stage: None,
            compaction_trace: Vec::new(),
            guide_mode,
            guide_cache_key,
            delta_packet: delta_packet_for(&run.task_ledger),
            dispatch_cli: routing.dispatch_cli,
            max_output_tokens,
        });
    }

    if !compaction_auto {
        return Err(DispatchError::PromptOverflowTerminal);
    }

    let mut trace = Vec::new();
    let masked = compaction::mask_preserving_dispatch_blocks(&full_prompt, 48, 24);
    let masked_tokens = compaction::estimate_tokens(&masked, compaction::DEFAULT_CHARS_PER_TOKEN);
    trace.push(TraceEntry {
        stage: Stage::Mask,
        prompt_tokens: masked_tokens,
    });

    let (final_prompt, final_tokens, stage) = if masked_tokens <= budget {
        (masked, masked_tokens, Stage::Mask)
    } else {
        let truncated: String = masked.chars().take((budget * compaction::DEFAULT_CHARS_PER_TOKEN) as usize).collect();
        let truncated_tokens =
            compaction::estimate_tokens(&truncated, compaction::DEFAULT_CHARS_PER_TOKEN).min(masked_tokens);
        trace.push(TraceEntry {
            stage: Stage::Truncate,
            prompt_tokens: truncated_tokens,
        });
        (truncated, truncated_tokens, Stage::Truncate)
    };

    debug_assert!(compaction::is_monotonic(&trace));

    Ok(CompiledPrompt {
        prompt: final_prompt,
        stable_prefix_hash,
        full_prompt_hash,
        prompt_tokens_before: tokens_before,
        prompt_tokens_after: final_tokens,
        prompt_token_budget: budget,
        compaction_applied: true,
        compaction_stage: Some(stage),
        compaction_trace: trace,
        guide_mode,
        guide_cache_key,
        delta_packet: delta_packet_for(&run.task_ledger),
        dispatch_cli: routing.dispatch_cli,
        max_output_tokens,
    })
}

/// One `tests` entry from the Implementer Output Contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestRun {
    command: String,
    passed: bool,
}

#[derive(Debug, Deserialize)]
struct ImplementerPayload {
    task_id: String,
    status: ImplementerStatus,
    summary: String,
    files_changed: Vec<String>,
    tests: Vec<TestRun>,
    #[serde(default)]
    follow_up_actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewerPayload {
    task_id: String,
    assessment: ReviewerAssessment,
    strengths: Vec<String>,
    #[serde(default)]
    issues: Vec<ReviewerIssue>,
    #[serde(default)]
    required_fixes: Vec<String>,
}

fn validate_markers(output: &str) -> Result<&str, DispatchError> {
    const BEGIN: &str = "BEGIN_DISPATCH_RESULT";
    const END: &str = "END_DISPATCH_RESULT";

    if !output.trim_start().starts_with(BEGIN) {
        return Err(DispatchError::MarkerMissingStart);
    }
    let begin_count = output.matches(BEGIN).count();
    let end_count = output.matches(END).count();
    if begin_count != 1 || end_count != 1 {
        return Err(DispatchError::MarkerMultipleBlocks);
    }

    let after_begin = &output[output.find(BEGIN).unwrap() + BEGIN.len()..];
    let end_idx = after_begin
        .find(END)
        .ok_or(DispatchError::MarkerMultipleBlocks)?;
    let payload = after_begin[..end_idx].trim();
    let trailing = after_begin[end_idx + END.len()..].trim();
    if !trailing.is_empty() {
        return Err(DispatchError::MarkerTrailingContent);
    }
    Ok(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    DispatchReviewer,
    CompleteTask,
    RedispatchImplementer,
    HaltSchemaInvalidTerminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    pub run_id: String,
    pub status: RunStatus,
    pub next_action: NextAction,
    pub error_code: Option<String>,
}

pub async fn ingest_output(
    registry: &RunRegistry,
    run_id: &str,
    role: Role,
    task_id: &str,
    output_content: &str,
) -> Result<IngestResult, DispatchError> {
    let run_lock = registry.get(run_id).await?;
    let mut run = run_lock.lock().await;

    if run.task_id != task_id {
        return Err(DispatchError::RunTaskMismatch {
            run_id: run_id.to_string(),
            expected: run.task_id.clone(),
            given: task_id.to_string(),
        });
    }

    let payload = match validate_markers(output_content) {
        Ok(p) => p,
        Err(e) => return Err(e),
    };

    let parsed = match role {
        Role::Implementer => serde_json::from_str::<ImplementerPayload>(payload).map(|p| {
            let contract_facts = vec![
                Fact::new("dispatch_implementer_task_id", p.task_id.clone(), 1.0),
                Fact::json("dispatch_implementer_files_changed", &p.files_changed, 1.0),
                Fact::json("dispatch_implementer_tests", &p.tests, 1.0),
            ];
            (
                Outcome::Implementer {
                    status: p.status,
                    summary: p.summary,
                    follow_up_actions: p.follow_up_actions,
                },
                contract_facts,
            )
        }),
        Role::Reviewer => serde_json::from_str::<ReviewerPayload>(payload).map(|p| {
            let contract_facts = vec![
                Fact::new("dispatch_reviewer_task_id", p.task_id.clone(), 1.0),
                Fact::json("dispatch_reviewer_strengths", &p.strengths, 1.0),
            ];
            (
                Outcome::Reviewer {
                    assessment: p.assessment,
                    issues: p.issues,
                    required_fixes: p.required_fixes,
                },
                contract_facts,
            )
        }),
    };

    let (outcome, contract_facts) = match parsed {
        Ok(o) => o,
        Err(_) => {
            let counter = run
                .schema_invalid_counts
                .entry(role.as_str().to_string())
                .or_insert(0);
            *counter += 1;
            run.status = RunStatus::Failed;
            return Ok(IngestResult {
                run_id: run_id.to_string(),
                status: RunStatus::Failed,
                next_action: NextAction::HaltSchemaInvalidTerminal,
                error_code: Some("schema_invalid".to_string()),
            });
        }
    };

    run.task_ledger = task::apply_outcome(&run.task_ledger, &outcome);
    if let Ok(refreshed) = progress::extract(&run.project_path, &run.spec_name, &run.task_id) {
        run.progress_ledger = refreshed;
    }
    run.facts.extend(task::to_facts(&run.task_ledger));
    run.facts.extend(progress::to_facts(&run.progress_ledger));
    run.facts.extend(contract_facts);

    let next_action = match &outcome {
        Outcome::Implementer { status, .. } => match status {
            ImplementerStatus::Completed => {
                run.status = RunStatus::AwaitingReview;
                NextAction::DispatchReviewer
            }
            ImplementerStatus::Blocked | ImplementerStatus::Failed => {
                run.status = RunStatus::Initialized;
                NextAction::RedispatchImplementer
            }
        },
        Outcome::Reviewer { assessment, .. } => match assessment {
            ReviewerAssessment::Approved => {
                run.status = RunStatus::Completed;
                NextAction::CompleteTask
            }
            ReviewerAssessment::NeedsChanges | ReviewerAssessment::Blocked => {
                run.status = RunStatus::Initialized;
                NextAction::RedispatchImplementer
            }
        },
    };

    Ok(IngestResult {
        run_id: run_id.to_string(),
        status: run.status,
        next_action,
        error_code: None,
    })
}

pub async fn get_snapshot(registry: &RunRegistry, run_id: &str) -> Result<Snapshot, DispatchError> {
    let run_lock = registry.get(run_id).await?;
    let run = run_lock.lock().await;
    Ok(run.snapshot())
}
