//! Upload command implementation

use std::path::Path;

use anyhow::{Context, Result};

use bs_core::hash::sha256_bytes_hex;
use bs_core::rpc::{UploadMetadata, UploadResult};

use crate::client::AgentClient;
use crate::output::{format_upload_result, format_upload_snapshot, print_error, print_success};

/// Encrypt and send `path` chunk by chunk, then finalize
pub async fn upload_bundle(
    client: &mut AgentClient,
    path: &Path,
    chunk_size: u64,
) -> Result<UploadResult> {
    anyhow::ensure!(chunk_size > 0, "Chunk size must be positive");
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{:?} has no file name", path))?;

    let ticket = client
        .start_upload(UploadMetadata {
            file_name,
            file_size: data.len() as u64,
            chunk_size,
            expected_checksum: sha256_bytes_hex(&data),
        })
        .await?;
    tracing::info!(
        "Uploading {:?} as {} in {} chunks",
        path,
        ticket.safe_name,
        ticket.total_chunks
    );

    let chunk_len = usize::try_from(chunk_size).context("Chunk size too large")?;
    for (index, chunk) in data.chunks(chunk_len).enumerate() {
        let index = u32::try_from(index).context("Too many chunks")?;
        let receipt = client.upload_chunk(chunk, index).await?;
        tracing::debug!(
            "Chunk {}/{} accepted ({:.1}%)",
            receipt.chunks_received,
            receipt.total_chunks,
            receipt.progress
        );
    }

    client.end_upload().await
}

/// Execute the upload command
pub async fn upload_command(client: &mut AgentClient, path: &Path, chunk_size: u64) -> Result<()> {
    match upload_bundle(client, path, chunk_size).await {
        Ok(result) => {
            print_success(&format_upload_result(&result));
            Ok(())
        }
        Err(e) => {
            print_error(&format!("Upload failed: {:#}", e));
            if let Ok(snapshot) = client.upload_status().await {
                print_error(&format_upload_snapshot(&snapshot));
            }
            Err(e)
        }
    }
}
