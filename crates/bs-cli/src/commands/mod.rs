//! CLI command implementations

mod control;
mod install;
mod status;
mod upload;

pub use control::control_command;
pub use install::install_command;
pub use status::{ping_command, status_command};
pub use upload::{upload_bundle, upload_command};
