//! spec-context runtime — the dispatch state machine, tool shell, and chat
//! execution core behind the `spec-context` MCP server.
//!
//! # Modules
//!
//! - [`config`]: environment-driven process configuration.
//! - [`error`]: the typed error taxonomy for every failure domain.
//! - [`hashing`]: SHA-256 hex hashing shared by prompt and cache-key code.
//! - [`ledger`]: progress-ledger extraction and task-ledger accumulation.
//! - [`compaction`]: the shared mask/summarize/truncate staged-compaction engine.
//! - [`registry`]: the tool visibility registry (mode/tier gating).
//! - [`reducer`]: the chat-history reducer built atop `compaction`.
//! - [`dispatch`]: the per-run dispatch state machine (init/compile/ingest/snapshot).
//! - [`chat`]: the interceptor-chain/budget/cache/provider/telemetry chat path.
//! - [`shell`]: the per-call tool shell (gate + dispatch + offload).

#![allow(clippy::uninlined_format_args)]

pub mod chat;
pub mod compaction;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hashing;
pub mod ledger;
pub mod reducer;
pub mod registry;
pub mod shell;

pub use config::Config;
pub use error::{ChatError, DispatchError, LedgerError, ReducerError, ShellError};
pub use hashing::sha256_hex;

pub use dispatch::{
    compile_prompt, get_snapshot, init_run, ingest_output, CompiledPrompt, IngestResult,
    InitRunResult, Level, NextAction, Role, Run, RunRegistry, RunStatus, Snapshot,
};

pub use ledger::{Fact, FactStore, Outcome, ProgressLedger, TaskLedger};

pub use reducer::{reduce, ChatMessage, InvariantStatus, ReduceResult, ReducerOptions};

pub use registry::{Mode, VisibilityRegistry};

pub use chat::{chat, BudgetDecision, BudgetGuard, ChatContext, ChatOptions, ChatResult};

pub use shell::{gate, offload_if_large, ShellContext, ShellResult};
