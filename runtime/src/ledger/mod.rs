//! Ledger Engine — progress ledger extraction and task ledger accumulation.

pub mod facts;
pub mod progress;
pub mod task;

pub use facts::{Fact, FactStore};
pub use progress::ProgressLedger;
pub use task::{Outcome, TaskLedger};
