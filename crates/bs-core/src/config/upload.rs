//! Upload policy

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::crypto::{NONCE_LEN, TAG_LEN};
use crate::error::ConfigError;

/// Room left for the JSON envelope around a chunk's base64 payload
const REQUEST_ENVELOPE_LEN: u64 = 4 * 1024;

/// Request lines may always be at least this long
const MIN_REQUEST_LINE_LEN: u64 = 1024 * 1024;

/// Limits applied to every upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadPolicy {
    /// Accepted archive suffixes, matched case-insensitively against the file name
    pub allowed_extensions: Vec<String>,

    /// Characters that may not appear in a file name
    pub forbidden_chars: Vec<char>,

    pub max_file_name_len: usize,

    /// Upper bound on the declared file size in bytes
    pub max_file_size: u64,

    /// Upper bound on the chunk size in bytes
    pub max_chunk_size: u64,

    /// Failed chunk attempts tolerated before the session is torn down
    pub max_retries: u32,

    /// Idle time after which the reaper discards an unfinished upload
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,

    /// Flush the destination file after this many accepted chunks
    pub flush_every: u32,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_extensions: [
                ".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".xz", ".tar.gz", ".tar.bz2",
                ".tgz", ".bundle",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            forbidden_chars: vec!['<', '>', ':', '"', '|', '?', '*', '/', '\\'],
            max_file_name_len: 255,
            max_file_size: 10 * 1024 * 1024,
            max_chunk_size: 100 * 1024,
            max_retries: 3,
            session_timeout: Duration::from_secs(30 * 60),
            flush_every: 10,
        }
    }
}

impl UploadPolicy {
    /// Longest request line a client needs to send
    ///
    /// Sized for an `UploadChunk` carrying a sealed chunk of
    /// `max_chunk_size` bytes, base64-encoded.
    pub fn max_request_line_len(&self) -> usize {
        let sealed = self
            .max_chunk_size
            .saturating_add((NONCE_LEN + TAG_LEN) as u64);
        let encoded = sealed.div_ceil(3).saturating_mul(4);
        let len = encoded
            .saturating_add(REQUEST_ENVELOPE_LEN)
            .max(MIN_REQUEST_LINE_LEN);
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_file_size == 0 || self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "upload size limits must be positive".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "upload.max_retries must be at least 1".to_string(),
            ));
        }
        if self.flush_every == 0 {
            return Err(ConfigError::Invalid(
                "upload.flush_every must be at least 1".to_string(),
            ));
        }
        if self.allowed_extensions.iter().any(|e| !e.starts_with('.')) {
            return Err(ConfigError::Invalid(
                "upload.allowed_extensions entries must start with '.'".to_string(),
            ));
        }
        Ok(())
    }
}
