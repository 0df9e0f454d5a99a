//! Upload session manager
//!
//! Owns at most one live transfer per connection. Each session sits behind
//! its own async mutex, held for the whole of a chunk acceptance or a
//! finalize so the duplicate check and the write are one atomic step.
//!
//! A failed decrypt or write does not record the chunk, so the client may
//! resend the same index. Once `max_retries` such failures accumulate the
//! session is torn down, key included.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use bs_core::config::UploadPolicy;
use bs_core::error::{UploadError, ValidationError};
use bs_core::hash::{checksum_matches, file_checksum};
use bs_core::rpc::{
    ChunkReceipt, ExtractionReport, UploadMetadata, UploadResult, UploadSnapshot, UploadTicket,
};
use bs_core::time::elapsed_duration;
use bs_core::{ConnectionId, UploadState};

use super::naming::{connection_dir, resolve_within, safe_file_name, safe_stem};
use super::session::UploadSession;
use super::validator::validate_metadata;
use crate::extract::Extractor;
use crate::keys::KeyStore;

type SessionHandle = Arc<Mutex<UploadSession>>;

/// Per-connection upload sessions
pub struct UploadManager {
    sessions: DashMap<ConnectionId, SessionHandle>,
    keys: Arc<KeyStore>,
    extractor: Arc<dyn Extractor>,
    policy: UploadPolicy,
    work_dir: PathBuf,
}

impl UploadManager {
    pub fn new(
        policy: UploadPolicy,
        work_dir: PathBuf,
        keys: Arc<KeyStore>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            keys,
            extractor,
            policy,
            work_dir,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Sandbox directory for a connection
    pub fn connection_dir(&self, id: &ConnectionId) -> PathBuf {
        connection_dir(&self.work_dir, id)
    }

    fn handle(&self, id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|r| Arc::clone(&r))
    }

    /// Open a new session, replacing any stale one
    pub async fn start_upload(
        &self,
        id: &ConnectionId,
        meta: UploadMetadata,
    ) -> Result<UploadTicket, UploadError> {
        if let Some(existing) = self.handle(id) {
            let mut stale = existing.lock().await;
            if stale.state == UploadState::Uploading {
                return Err(UploadError::UploadInProgress);
            }
            tracing::debug!(
                "Disposing previous upload {} ({}) for {}",
                stale.session_id,
                stale.state,
                id
            );
            stale.release().await;
            drop(stale);
            self.sessions.remove(id);
        }

        let extension = validate_metadata(&meta, &self.policy)?;

        let dir = self.connection_dir(id);
        tokio::fs::create_dir_all(&dir).await?;

        let safe_name = safe_file_name(&meta.file_name, &extension, &self.policy);
        let path = resolve_within(&dir, &safe_name)?;

        let total_chunks = u32::try_from(meta.file_size.div_ceil(meta.chunk_size)).map_err(
            |_| ValidationError::InvalidChunkSize {
                size: meta.chunk_size,
                max: self.policy.max_chunk_size,
            },
        )?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut session = UploadSession::new(
            id.clone(),
            meta.file_name,
            safe_name,
            meta.file_size,
            meta.chunk_size,
            meta.expected_checksum,
            total_chunks,
            path,
            file,
        );
        session.state = UploadState::Uploading;

        tracing::info!(
            "Upload {} started for {}: {} ({} bytes, {} chunks of {})",
            session.session_id,
            id,
            session.file_name,
            session.file_size,
            session.total_chunks,
            session.chunk_size
        );

        let ticket = UploadTicket {
            session_id: session.session_id.clone(),
            safe_name: session.safe_name.clone(),
            total_chunks,
        };
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(session)));
        Ok(ticket)
    }

    /// Decrypt one chunk and write it at its offset
    pub async fn process_chunk(
        &self,
        id: &ConnectionId,
        sealed: &[u8],
        index: i64,
    ) -> Result<ChunkReceipt, UploadError> {
        let handle = self.handle(id).ok_or(UploadError::NoActiveSession)?;
        let mut guard = handle.lock().await;
        let session = &mut *guard;

        if session.state != UploadState::Uploading {
            return Err(UploadError::InvalidSessionState {
                state: session.state,
            });
        }

        let index = u32::try_from(index)
            .ok()
            .filter(|i| *i < session.total_chunks)
            .ok_or(UploadError::InvalidChunkNumber {
                index,
                total: session.total_chunks,
            })?;

        if session.has_chunk(index) {
            tracing::debug!("Duplicate chunk {} for upload {}", index, session.session_id);
            session.touch();
            return Ok(session.receipt(index, true));
        }

        match self.write_chunk(session, id, sealed, index).await {
            Ok(len) => {
                session.record_chunk(index, len);
                if session.chunks_received() % self.policy.flush_every == 0 {
                    if let Some(file) = session.file.as_mut() {
                        if let Err(e) = sync(file).await {
                            tracing::warn!("Periodic flush of {:?} failed: {}", session.path, e);
                        }
                    }
                }
                tracing::debug!(
                    "Chunk {}/{} accepted for upload {}",
                    session.chunks_received(),
                    session.total_chunks,
                    session.session_id
                );
                Ok(session.receipt(index, false))
            }
            Err(e) => {
                session.retry_count += 1;
                session.last_error = Some(e.to_string());
                tracing::warn!(
                    "Chunk {} failed for upload {} (attempt {}/{}): {}",
                    index,
                    session.session_id,
                    session.retry_count,
                    self.policy.max_retries,
                    e
                );

                if session.retry_count < self.policy.max_retries {
                    return Err(e);
                }

                session.state = UploadState::Failed;
                session.release().await;
                let attempts = session.retry_count;
                tracing::error!(
                    "Upload {} failed after {} attempts, cleaning up",
                    session.session_id,
                    attempts
                );
                drop(guard);
                self.sessions.remove(id);
                self.keys.remove(id);

                Err(UploadError::RetryExhausted {
                    attempts,
                    last_error: e.to_string(),
                })
            }
        }
    }

    async fn write_chunk(
        &self,
        session: &mut UploadSession,
        id: &ConnectionId,
        sealed: &[u8],
        index: u32,
    ) -> Result<u64, UploadError> {
        let plaintext = self
            .keys
            .decrypt(id, sealed)
            .map_err(UploadError::DecryptionFailed)?;

        let expected = session.expected_chunk_len(index);
        let actual = plaintext.len() as u64;
        if actual != expected {
            return Err(UploadError::ChunkLengthMismatch {
                index,
                expected,
                actual,
            });
        }

        let offset = session.offset_of(index);
        let state = session.state;
        let file = session
            .file
            .as_mut()
            .ok_or(UploadError::InvalidSessionState { state })?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&plaintext).await?;
        Ok(actual)
    }

    /// Verify the finished file and hand it to extraction
    pub async fn end_upload(&self, id: &ConnectionId) -> Result<UploadResult, UploadError> {
        let handle = self.handle(id).ok_or(UploadError::NoActiveSession)?;
        let mut session = handle.lock().await;

        if session.state != UploadState::Uploading {
            return Err(UploadError::InvalidSessionState {
                state: session.state,
            });
        }
        if !session.is_complete() {
            return Err(UploadError::IncompleteUpload {
                missing: session.missing_chunks(),
            });
        }

        session.state = UploadState::Finalizing;
        let checksum = match verify(&mut session).await {
            Ok(checksum) => checksum,
            Err(e) => {
                tracing::error!("Upload {} failed verification: {}", session.session_id, e);
                session.state = UploadState::Failed;
                session.last_error = Some(e.to_string());
                session.release().await;
                return Err(e);
            }
        };

        session.state = UploadState::Completed;
        let path = session.path.clone();
        let session_id = session.session_id.clone();
        let file_size = session.file_size;
        let extract_to = path
            .parent()
            .unwrap_or(Path::new("."))
            .join(safe_stem(&session.safe_name));
        tracing::info!("Upload {} completed: {:?}", session_id, path);
        drop(session);
        self.sessions.remove(id);

        let extraction = match self.extractor.extract(&path, &extract_to).await {
            Ok(summary) => ExtractionReport {
                success: true,
                destination: Some(summary.destination),
                file_count: summary.file_count,
                total_bytes: summary.total_bytes,
                error: None,
            },
            Err(e) => {
                tracing::error!("Extraction of {:?} failed: {}", path, e);
                ExtractionReport {
                    success: false,
                    destination: None,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        Ok(UploadResult {
            session_id,
            file_path: path,
            file_size,
            checksum,
            extraction,
        })
    }

    /// Drop the connection's session and key; partial files are deleted
    pub async fn cleanup(&self, id: &ConnectionId) -> bool {
        let existed = self.discard(id).await;
        self.keys.remove(id);
        existed
    }

    async fn discard(&self, id: &ConnectionId) -> bool {
        let Some((_, handle)) = self.sessions.remove(id) else {
            return false;
        };
        let mut session = handle.lock().await;
        if !session.state.is_terminal() {
            session.state = UploadState::Cancelled;
        }
        session.release().await;
        tracing::info!("Cleaned up upload {} for {}", session.session_id, id);
        true
    }

    /// Current state of the connection's session
    pub async fn snapshot(&self, id: &ConnectionId) -> Option<UploadSnapshot> {
        let handle = self.handle(id)?;
        let session = handle.lock().await;
        Some(session.snapshot())
    }

    pub fn has_session(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Discard unfinished sessions idle for longer than `timeout`
    ///
    /// Sessions whose lock is held are in use and skipped. Keys stay with the
    /// connection, which may start a fresh upload afterwards.
    pub async fn expire_idle(&self, timeout: Duration) -> usize {
        let candidates: Vec<(ConnectionId, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut expired = 0;
        for (id, handle) in candidates {
            if self.expire_if_idle(&id, &handle, timeout).await {
                expired += 1;
            }
        }
        expired
    }

    /// Idleness is re-checked under the session lock, and only the entry
    /// still mapped to `handle` is removed
    async fn expire_if_idle(
        &self,
        id: &ConnectionId,
        handle: &SessionHandle,
        timeout: Duration,
    ) -> bool {
        let Ok(mut session) = handle.try_lock() else {
            return false;
        };
        if session.state.is_terminal() || elapsed_duration(session.last_activity) <= timeout {
            return false;
        }
        let removed = self
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if !removed {
            return false;
        }

        session.state = UploadState::Cancelled;
        session.release().await;
        tracing::info!(
            "Expired upload {} for {} after {:?} idle",
            session.session_id,
            id,
            timeout
        );
        true
    }
}

async fn sync(file: &mut tokio::fs::File) -> std::io::Result<()> {
    file.flush().await?;
    file.sync_data().await
}

/// Close the handle, then check length and checksum
async fn verify(session: &mut UploadSession) -> Result<String, UploadError> {
    if let Some(mut file) = session.file.take() {
        sync(&mut file).await?;
    }

    let actual = tokio::fs::metadata(&session.path).await?.len();
    if actual != session.file_size {
        return Err(UploadError::FileSizeMismatch {
            expected: session.file_size,
            actual,
        });
    }

    let path = session.path.clone();
    let checksum = tokio::task::spawn_blocking(move || file_checksum(&path))
        .await
        .map_err(|e| UploadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    if !checksum_matches(&session.expected_checksum, &checksum) {
        return Err(UploadError::ChecksumMismatch);
    }
    Ok(checksum)
}
