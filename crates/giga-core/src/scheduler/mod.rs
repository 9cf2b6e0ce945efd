//! Chunk scheduling: connection budget and the per-mission worker pool.

mod budget;
mod run;

pub use budget::{BudgetLease, GlobalConnectionBudget};
pub use run::{run_chunks, ChunkJob, FailureHook, RunOutcome};
