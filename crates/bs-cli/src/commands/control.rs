//! Control command implementation

use anyhow::Result;

use crate::client::AgentClient;
use crate::output::{format_control_result, print_error};

/// Execute the control command (`stop` or `continue`)
pub async fn control_command(client: &mut AgentClient, action: &str) -> Result<()> {
    match client.control(action).await? {
        Some(result) => println!("{}", format_control_result(&result)),
        None => print_error("No active installation session"),
    }
    Ok(())
}
