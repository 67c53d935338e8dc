//! Dispatch Runtime — the `init_run / compile_prompt / ingest_output /
//! get_snapshot` state machine (4.A), plus its classification, prompt
//! assembly, and run-registry supporting pieces.

pub mod actions;
pub mod classify;
pub mod prompt;
pub mod run;

pub use actions::{init_run, compile_prompt, get_snapshot, ingest_output, CompiledPrompt, IngestResult, InitRunResult, NextAction};
pub use classify::{Level, Role};
pub use run::{Run, RunRegistry, RunStatus, Snapshot};
