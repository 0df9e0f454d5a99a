//! State of one in-flight transfer

use std::collections::BTreeSet;
use std::path::PathBuf;

use bs_core::rpc::{ChunkReceipt, UploadSnapshot};
use bs_core::time::current_time_millis;
use bs_core::{ConnectionId, UploadState};

/// One file transfer scoped to a connection
///
/// Guarded by its own mutex in the manager. `received.len()` is the
/// received-chunk counter, so the two can never disagree.
#[derive(Debug)]
pub struct UploadSession {
    pub session_id: String,
    pub connection_id: ConnectionId,
    pub file_name: String,
    pub safe_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub expected_checksum: String,
    pub total_chunks: u32,
    pub path: PathBuf,
    pub bytes_received: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub state: UploadState,
    pub created_at: u64,
    pub last_activity: u64,
    pub(crate) file: Option<tokio::fs::File>,
    received: BTreeSet<u32>,
}

impl UploadSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection_id: ConnectionId,
        file_name: String,
        safe_name: String,
        file_size: u64,
        chunk_size: u64,
        expected_checksum: String,
        total_chunks: u32,
        path: PathBuf,
        file: tokio::fs::File,
    ) -> Self {
        let now = current_time_millis();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            connection_id,
            file_name,
            safe_name,
            file_size,
            chunk_size,
            expected_checksum,
            total_chunks,
            path,
            bytes_received: 0,
            retry_count: 0,
            last_error: None,
            state: UploadState::Initialized,
            created_at: now,
            last_activity: now,
            file: Some(file),
            received: BTreeSet::new(),
        }
    }

    pub fn chunks_received(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.received.contains(&index)
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.chunks_received() == self.total_chunks
    }

    /// Indices not yet received, ascending
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Byte offset of a chunk in the destination file
    pub fn offset_of(&self, index: u32) -> u64 {
        u64::from(index) * self.chunk_size
    }

    /// Plaintext length a chunk must have; only the last may be short
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        self.file_size
            .saturating_sub(self.offset_of(index))
            .min(self.chunk_size)
    }

    pub(crate) fn record_chunk(&mut self, index: u32, len: u64) {
        if self.received.insert(index) {
            self.bytes_received += len;
        }
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = current_time_millis();
    }

    /// Percentage of chunks received, 0.0 to 100.0
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.chunks_received()) * 100.0 / f64::from(self.total_chunks)
    }

    pub fn receipt(&self, index: u32, duplicate: bool) -> ChunkReceipt {
        ChunkReceipt {
            chunk_index: index,
            duplicate,
            chunks_received: self.chunks_received(),
            total_chunks: self.total_chunks,
            bytes_received: self.bytes_received,
            progress: self.progress(),
        }
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            session_id: self.session_id.clone(),
            connection_id: self.connection_id.to_string(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            chunks_received: self.chunks_received(),
            bytes_received: self.bytes_received,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            state: self.state,
        }
    }

    /// Close the handle and delete the file unless the transfer completed
    pub(crate) async fn release(&mut self) {
        self.file = None;
        if self.state != UploadState::Completed {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => tracing::debug!("Removed partial upload {:?}", self.path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove partial upload {:?}: {}", self.path, e),
            }
        }
    }
}
