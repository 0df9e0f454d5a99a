//! Status and ping command implementations

use anyhow::Result;

use crate::client::AgentClient;
use crate::output::{format_session_report, print_info, print_success};

/// Execute the status command
pub async fn status_command(client: &mut AgentClient) -> Result<()> {
    match client.session_status().await? {
        Some(report) => println!("{}", format_session_report(&report)),
        None => print_info("No active session"),
    }
    Ok(())
}

/// Execute the ping command
pub async fn ping_command(client: &mut AgentClient) -> Result<()> {
    if client.ping().await? {
        print_success(&format!("Agent at {} is responding", client.address()));
    } else {
        anyhow::bail!("Agent at {} did not answer the ping", client.address());
    }
    Ok(())
}
