//! Typed error taxonomy for every failure domain the runtime can hit.
//!
//! Each enum carries an `error_code()` mapping to the exact string codes
//! named in the specification so tool envelopes are built from one
//! `From<XError>` impl per domain instead of ad hoc string matching.

use thiserror::Error;

/// Errors raised while extracting or round-tripping the progress/task ledgers.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("tasks file not found at {0}")]
    MissingTasksFile(String),
    #[error("tasks file at {0} contains no parseable task markers")]
    ParseFailed(String),
    #[error("progress ledger facts incomplete: missing key {0}")]
    Incomplete(String),
    #[error("failed to read tasks file: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingTasksFile(_) => "progress_ledger_missing_tasks",
            Self::ParseFailed(_) => "progress_ledger_parse_failed",
            Self::Incomplete(_) => "progress_ledger_incomplete",
            Self::Io(_) => "progress_ledger_parse_failed",
        }
    }
}

/// Errors raised by the dispatch runtime state machine.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run {0} has not been initialized")]
    RunNotInitialized(String),
    #[error("task {given} does not match the initialized task {expected} for run {run_id}")]
    RunTaskMismatch {
        run_id: String,
        expected: String,
        given: String,
    },
    #[error("dispatched output failed schema validation")]
    SchemaInvalid,
    #[error("compiled prompt exceeds token budget and auto-compaction is disabled or exhausted")]
    PromptOverflowTerminal,
    #[error("output does not start with BEGIN_DISPATCH_RESULT")]
    MarkerMissingStart,
    #[error("output contains more than one BEGIN_DISPATCH_RESULT/END_DISPATCH_RESULT block")]
    MarkerMultipleBlocks,
    #[error("output contains trailing content after END_DISPATCH_RESULT")]
    MarkerTrailingContent,
    #[error("no run found with id {0}")]
    RunNotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl DispatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotInitialized(_) => "run_not_initialized",
            Self::RunTaskMismatch { .. } => "run_task_mismatch",
            Self::SchemaInvalid => "schema_invalid",
            Self::PromptOverflowTerminal => "dispatch_prompt_overflow_terminal",
            Self::MarkerMissingStart | Self::MarkerMultipleBlocks | Self::MarkerTrailingContent => {
                "marker_violation"
            }
            Self::RunNotFound(_) => "run_not_initialized",
            Self::Ledger(e) => e.error_code(),
        }
    }
}

/// Errors raised by the history reducer. Pair-invariant violations are
/// recovered internally (fallback stage) and are not represented here —
/// they surface only as telemetry, per the propagation policy.
#[derive(Debug, Error)]
pub enum ReducerError {
    #[error("reducer options are invalid: {0}")]
    InvalidOptions(String),
}

/// Errors raised by the chat execution path.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request dropped by interceptor at hook {0}")]
    InterceptorDropped(&'static str),
    #[error("budget guard denied the request: {0}")]
    BudgetExceeded(String),
    #[error("provider request failed: {0}")]
    ProviderRequest(String),
    #[error("provider request timed out after {0}s")]
    Timeout(u64),
}

impl ChatError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InterceptorDropped(_) => "InterceptorDropped",
            Self::BudgetExceeded(_) => "BudgetExceeded",
            Self::ProviderRequest(_) => "provider_error",
            Self::Timeout(_) => "provider_timeout",
        }
    }
}

/// Errors raised by the MCP tool shell.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {0} is not visible in the current session mode/tier")]
    NotVisible(String),
    #[error("failed to offload tool result: {0}")]
    Offload(#[from] std::io::Error),
}
