//! CLI command handlers, one file per command.

mod add;
mod completions;
mod control;
mod forget;
mod run;
mod status;

pub use add::run_add;
pub use completions::{run_completions, run_man};
pub use control::run_control;
pub use forget::run_forget;
pub use run::run_engine;
pub use status::run_status;
