//! Client for the agent's JSON-lines protocol
//!
//! The agent delivers the connection's encryption key as the first line, so
//! `connect` completes only once that key has arrived. Progress events that
//! arrive while waiting for a response are queued for `next_progress`.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use bs_core::crypto::{seal, EncryptionKey};
use bs_core::rpc::{
    to_line, ChunkReceipt, ControlInstallResult, InstallProgress, InstallRequestItem,
    InstallResult, RpcEvent, RpcRequest, RpcResponse, ServerMessage, SessionStatusReport,
    UploadMetadata, UploadResult, UploadSnapshot, UploadTicket,
};

/// Default agent address
pub const DEFAULT_AGENT_ADDRESS: &str = "127.0.0.1:5701";

/// An admitted connection to the agent
pub struct AgentClient {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    key: EncryptionKey,
    progress: VecDeque<InstallProgress>,
}

impl AgentClient {
    /// Connect and wait for admission
    pub async fn connect(address: &str) -> Result<Self> {
        tracing::debug!("Connecting to agent at {}", address);

        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("Failed to connect to agent at {}. Is it running?", address))?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let key = match read_message(&mut reader).await? {
            Some(ServerMessage::Event(RpcEvent::SetEncryptionKey { key })) => {
                EncryptionKey::from_base64(&key).context("Agent sent an invalid key")?
            }
            Some(ServerMessage::Event(RpcEvent::Rejected { reason })) => {
                anyhow::bail!("Agent rejected the connection: {}", reason)
            }
            Some(other) => anyhow::bail!("Unexpected first message: {:?}", other),
            None => anyhow::bail!("Agent closed the connection"),
        };
        tracing::debug!("Admitted by agent at {}", address);

        Ok(Self {
            address: address.to_string(),
            reader,
            writer: BufWriter::new(writer),
            key,
            progress: VecDeque::new(),
        })
    }

    /// Get the address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its response
    pub async fn send_request(&mut self, request: RpcRequest) -> Result<RpcResponse> {
        let line = to_line(&request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            match read_message(&mut self.reader).await? {
                Some(ServerMessage::Response(response)) => return Ok(response),
                Some(ServerMessage::Event(event)) => self.queue_event(event),
                None => anyhow::bail!("Agent closed the connection"),
            }
        }
    }

    fn queue_event(&mut self, event: RpcEvent) {
        match event {
            RpcEvent::ReceiveInstallationStatus(progress) => self.progress.push_back(progress),
            other => tracing::debug!("Ignoring event {:?}", other),
        }
    }

    /// Next item progress notification, waiting if none is queued
    pub async fn next_progress(&mut self) -> Result<InstallProgress> {
        if let Some(progress) = self.progress.pop_front() {
            return Ok(progress);
        }
        loop {
            match read_message(&mut self.reader).await? {
                Some(ServerMessage::Event(RpcEvent::ReceiveInstallationStatus(progress))) => {
                    return Ok(progress)
                }
                Some(other) => tracing::debug!("Ignoring message {:?}", other),
                None => anyhow::bail!("Agent closed the connection"),
            }
        }
    }

    /// Check the agent answers
    pub async fn ping(&mut self) -> Result<bool> {
        Ok(matches!(
            self.send_request(RpcRequest::Ping).await?,
            RpcResponse::Pong
        ))
    }

    pub async fn start_upload(&mut self, metadata: UploadMetadata) -> Result<UploadTicket> {
        match self.send_request(RpcRequest::StartUpload(metadata)).await? {
            RpcResponse::UploadStarted(ticket) => Ok(ticket),
            other => Err(unexpected(other)),
        }
    }

    /// Encrypt and send one chunk
    pub async fn upload_chunk(&mut self, plaintext: &[u8], index: u32) -> Result<ChunkReceipt> {
        let data = seal(&self.key, plaintext).context("Failed to encrypt chunk")?;
        let request = RpcRequest::UploadChunk {
            data,
            chunk_index: i64::from(index),
        };
        match self.send_request(request).await? {
            RpcResponse::ChunkAccepted(receipt) => Ok(receipt),
            other => Err(unexpected(other)),
        }
    }

    pub async fn end_upload(&mut self) -> Result<UploadResult> {
        match self.send_request(RpcRequest::EndUpload).await? {
            RpcResponse::UploadCompleted(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn upload_status(&mut self) -> Result<UploadSnapshot> {
        match self.send_request(RpcRequest::GetUploadStatus).await? {
            RpcResponse::UploadStatus(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    pub async fn install(&mut self, items: Vec<InstallRequestItem>) -> Result<InstallResult> {
        match self.send_request(RpcRequest::Install { items }).await? {
            RpcResponse::InstallStarted(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// `None` when the agent has no installation session
    pub async fn control(&mut self, action: &str) -> Result<Option<ControlInstallResult>> {
        let request = RpcRequest::ControlInstall {
            action: action.to_string(),
        };
        match self.send_request(request).await? {
            RpcResponse::ControlInstall(result) => Ok(Some(result)),
            RpcResponse::NoActiveSession => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// `None` when the agent has no installation session
    pub async fn session_status(&mut self) -> Result<Option<SessionStatusReport>> {
        match self.send_request(RpcRequest::GetSessionStatus).await? {
            RpcResponse::SessionStatus(report) => Ok(Some(report)),
            RpcResponse::NoActiveSession => Ok(None),
            other => Err(unexpected(other)),
        }
    }
}

async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<ServerMessage>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end())
        .with_context(|| format!("Invalid message from agent: {}", line.trim_end()))?;
    Ok(Some(message))
}

fn unexpected(response: RpcResponse) -> anyhow::Error {
    match response {
        RpcResponse::Error { kind, message } => anyhow::anyhow!("{:?}: {}", kind, message),
        RpcResponse::NoActiveSession => anyhow::anyhow!("No active session"),
        other => anyhow::anyhow!("Unexpected response: {:?}", other),
    }
}

/// Parse `id@version`
pub fn parse_package(spec: &str) -> Result<InstallRequestItem> {
    let (id, version) = spec
        .rsplit_once('@')
        .with_context(|| format!("Expected <id>@<version>, got '{}'", spec))?;
    if id.trim().is_empty() || version.trim().is_empty() {
        anyhow::bail!("Expected <id>@<version>, got '{}'", spec);
    }
    Ok(InstallRequestItem {
        id: id.trim().to_string(),
        version: version.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_package() {
        let item = parse_package("com.example.tool@2.1.0").unwrap();
        assert_eq!(item.id, "com.example.tool");
        assert_eq!(item.version, "2.1.0");

        let item = parse_package("@scope/pkg@1.0").unwrap();
        assert_eq!(item.id, "@scope/pkg");
    }

    #[test]
    fn test_parse_package_rejects_malformed() {
        assert!(parse_package("no-version").is_err());
        assert!(parse_package("id@").is_err());
        assert!(parse_package("@1.0").is_err());
    }
}
