//! Remote-procedure protocol between clients and the agent
//!
//! One JSON document per line over TCP. Requests are tagged by `type` using
//! the action names clients already speak (`StartUpload`, `UploadChunk`, ...).
//! Responses answer requests one-to-one and are also tagged by `type`; events
//! are pushed at any time and are tagged by `event`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::serde_utils::base64_bytes;
use crate::error::ErrorKind;
use crate::types::{ItemStatus, SessionStatus, UploadState};

/// Request from client to agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcRequest {
    /// Begin an upload session
    StartUpload(UploadMetadata),

    /// Feed one encrypted chunk
    UploadChunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(rename = "chunkIndex")]
        chunk_index: i64,
    },

    /// Finalize the transfer
    EndUpload,

    /// Snapshot of this connection's upload session
    GetUploadStatus,

    /// Start installing a package set
    Install { items: Vec<InstallRequestItem> },

    /// Pause or resume the queue
    ControlInstall { action: String },

    /// Poll the installation session
    GetSessionStatus,

    /// Keepalive
    Ping,
}

/// Response from agent to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RpcResponse {
    UploadStarted(UploadTicket),

    ChunkAccepted(ChunkReceipt),

    UploadCompleted(UploadResult),

    UploadStatus(UploadSnapshot),

    InstallStarted(InstallResult),

    ControlInstall(ControlInstallResult),

    SessionStatus(SessionStatusReport),

    /// No installation session exists yet
    NoActiveSession,

    Pong,

    /// Structured failure; the connection stays open
    Error { kind: ErrorKind, message: String },
}

/// Event pushed from agent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RpcEvent {
    /// Key for this connection, sent once on admission
    SetEncryptionKey { key: String },

    /// Admission refused; the agent closes the stream after sending this
    Rejected { reason: String },

    /// Item finished, successfully or not
    ReceiveInstallationStatus(InstallProgress),
}

/// Anything the agent writes to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(RpcResponse),
    Event(RpcEvent),
}

impl From<RpcResponse> for ServerMessage {
    fn from(resp: RpcResponse) -> Self {
        ServerMessage::Response(resp)
    }
}

impl From<RpcEvent> for ServerMessage {
    fn from(event: RpcEvent) -> Self {
        ServerMessage::Event(event)
    }
}

/// Serialize a message as one newline-terminated JSON line
pub fn to_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Declared properties of a file about to be uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub expected_checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub session_id: String,
    /// Name the file is stored under on the host
    pub safe_name: String,
    pub total_chunks: u32,
}

/// Outcome of one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub chunk_index: u32,
    /// Chunk was already recorded; nothing was written
    pub duplicate: bool,
    pub chunks_received: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    /// 0.0 to 100.0
    pub progress: f64,
}

/// Result of a verified upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub session_id: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub checksum: String,
    pub extraction: ExtractionReport,
}

/// What the extraction collaborator made of a verified upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionReport {
    pub success: bool,
    pub destination: Option<PathBuf>,
    pub file_count: usize,
    pub total_bytes: u64,
    pub error: Option<String>,
}

/// Point-in-time view of an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub session_id: String,
    pub connection_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub chunks_received: u32,
    pub bytes_received: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub state: UploadState,
}

/// One package requested for installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequestItem {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub session_id: String,
    pub status: SessionStatus,
    /// Items materialized into the queue
    pub queued: usize,
}

/// Full view of one queue item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub status: ItemStatus,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
}

/// Answer to `ControlInstall`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlInstallResult {
    pub action: String,
    pub result: String,
    pub status: SessionStatus,
    pub paused: bool,
    pub connected: bool,
    /// Name of the installing item, or `"None"`
    pub current_item: String,
    pub items: Vec<ItemSnapshot>,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatusEntry {
    pub id: String,
    pub version: String,
    pub status: ItemStatus,
}

/// Answer to `GetSessionStatus`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub session_id: String,
    pub status: SessionStatus,
    pub items: Vec<ItemStatusEntry>,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Progress notification for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallProgress {
    pub id: String,
    pub version: String,
    /// 100 on success, 0 on failure
    pub progress: u8,
    pub status: ItemStatus,
    pub has_error: bool,
    pub error_message: Option<String>,
}
