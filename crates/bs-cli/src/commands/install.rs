//! Install command implementation

use std::path::Path;

use anyhow::Result;

use crate::client::{parse_package, AgentClient};
use crate::output::{format_progress, format_upload_result, print_error, print_info, print_success};

use super::upload::upload_bundle;

/// Execute the install command
///
/// With a bundle, uploads it first on the same connection so the agent can
/// find the extracted packages. With `wait`, follows progress until every
/// queued item has finished.
pub async fn install_command(
    client: &mut AgentClient,
    bundle: Option<&Path>,
    chunk_size: u64,
    packages: &[String],
    wait: bool,
) -> Result<()> {
    let items = packages
        .iter()
        .map(|p| parse_package(p))
        .collect::<Result<Vec<_>>>()?;

    if let Some(path) = bundle {
        let result = upload_bundle(client, path, chunk_size).await?;
        print_success(&format_upload_result(&result));
    }

    let result = client.install(items).await?;
    print_info(&format!(
        "Installation session {} is {} with {} queued items",
        result.session_id, result.status, result.queued
    ));
    if !wait || result.queued == 0 {
        return Ok(());
    }

    let mut failures = 0;
    loop {
        let progress = client.next_progress().await?;
        if progress.has_error {
            failures += 1;
            print_error(&format_progress(&progress));
        } else {
            print_success(&format_progress(&progress));
        }

        let Some(report) = client.session_status().await? else {
            anyhow::bail!("Installation session disappeared");
        };
        if report.total > 0 && report.completed + report.failed == report.total {
            break;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} item(s) failed to install", failures);
    }
    Ok(())
}
