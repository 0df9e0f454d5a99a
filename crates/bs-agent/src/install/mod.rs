//! Installation queue and script execution

mod item;
mod orchestrator;
pub mod runner;
mod session;

pub use item::InstallationItem;
pub use orchestrator::InstallOrchestrator;
pub use runner::{ScriptRunner, ShellScriptRunner};
pub use session::{InstallationSession, StatusCounts};
