//! Core error types for the bootstrap agent

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::UploadState;

/// Top-level error type for the bootstrap agent
#[derive(Error, Debug)]
pub enum BsError {
    /// Connection is not registered or no longer active
    #[error("Connection not authorized")]
    Unauthorized,

    /// Encryption error
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// Upload error
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Installation error
    #[error("Install error: {0}")]
    Install(#[from] InstallError),

    /// Extraction error
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BsError {
    /// Wire-level classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BsError::Unauthorized => ErrorKind::Unauthorized,
            BsError::Crypto(e) => e.kind(),
            BsError::Upload(e) => e.kind(),
            BsError::Install(e) => e.kind(),
            BsError::Extraction(_) | BsError::Config(_) | BsError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Failure classes reported to remote callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthorized,
    ValidationError,
    SessionStateError,
    DecryptionFailed,
    ChecksumMismatch,
    IncompleteUpload,
    RetryExhausted,
    ScriptExecutionFailed,
    PlatformUnsupported,
    DirectoryNotFound,
    Internal,
}

/// Key store and AEAD errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No key has been issued for the connection
    #[error("Encryption key not found for connection")]
    KeyNotFound,

    /// Input is shorter than nonce plus tag
    #[error("Encrypted data is too short: {len} bytes, need at least {min}")]
    DataTooShort { len: usize, min: usize },

    /// Tag verification failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Sealing failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Key material could not be decoded
    #[error("Invalid encryption key: {0}")]
    KeyDecoding(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidInput(_) | CryptoError::KeyDecoding(_) => {
                ErrorKind::ValidationError
            }
            CryptoError::EncryptionFailed => ErrorKind::Internal,
            _ => ErrorKind::DecryptionFailed,
        }
    }
}

/// Structural checks on upload metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid file size: {size} (allowed 1..={max})")]
    InvalidFileSize { size: u64, max: u64 },

    #[error("Invalid chunk size: {size} (allowed 1..={max})")]
    InvalidChunkSize { size: u64, max: u64 },

    #[error("Expected checksum is missing")]
    MissingChecksum,
}

/// Upload session errors
#[derive(Error, Debug)]
pub enum UploadError {
    /// Metadata rejected by the validator
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A transfer is already running for this connection
    #[error("An upload is already in progress")]
    UploadInProgress,

    /// No session exists for this connection
    #[error("No active upload session found")]
    NoActiveSession,

    /// Operation not allowed in the current state
    #[error("Cannot upload file in state: {state}")]
    InvalidSessionState { state: UploadState },

    /// Chunk index outside `[0, total)`
    #[error("Invalid chunk number {index} (total chunks: {total})")]
    InvalidChunkNumber { index: i64, total: u32 },

    /// Destination resolved outside the sandbox directory
    #[error("Invalid file path detected: {0}")]
    InvalidFilePath(PathBuf),

    /// Chunk could not be decrypted
    #[error("Decryption failed: {0}")]
    DecryptionFailed(#[source] CryptoError),

    /// Decrypted chunk does not fit its slot in the file
    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkLengthMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    /// Not every chunk has been received
    #[error("Upload incomplete. Missing chunks: {}", join_indices(.missing))]
    IncompleteUpload { missing: Vec<u32> },

    /// Final file length differs from the declared size
    #[error("File size mismatch. Expected: {expected}, Actual: {actual}")]
    FileSizeMismatch { expected: u64, actual: u64 },

    /// Content hash differs from the expected checksum
    #[error("Invalid checksum")]
    ChecksumMismatch,

    /// Chunk failures reached the retry cap; the session has been torn down
    #[error("Upload failed after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Validation(_)
            | UploadError::InvalidChunkNumber { .. }
            | UploadError::InvalidFilePath(_)
            | UploadError::ChunkLengthMismatch { .. } => ErrorKind::ValidationError,
            UploadError::UploadInProgress
            | UploadError::NoActiveSession
            | UploadError::InvalidSessionState { .. } => ErrorKind::SessionStateError,
            UploadError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            UploadError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            UploadError::FileSizeMismatch { .. } | UploadError::ChecksumMismatch => {
                ErrorKind::ChecksumMismatch
            }
            UploadError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            UploadError::Io(_) => ErrorKind::Internal,
        }
    }
}

fn join_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Installation orchestrator errors
#[derive(Error, Debug)]
pub enum InstallError {
    /// No installation session has been created
    #[error("No installation session exists")]
    NoSession,

    /// The base folder has not been linked to the session
    #[error("Base folder path not set for installation session")]
    BaseFolderNotSet,

    /// A required directory is missing
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    /// Host OS has no script layout
    #[error("Unsupported platform: {0}")]
    PlatformUnsupported(String),

    /// A stage script exited unsuccessfully
    #[error("Script '{script}' failed with exit code {}", .code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    ScriptExecutionFailed { script: String, code: Option<i32> },

    /// The item folder holds no runnable script
    #[error("No runnable scripts in {0}")]
    ScriptMissing(PathBuf),

    /// The background task died before reporting
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// File system or process spawn failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstallError::NoSession | InstallError::BaseFolderNotSet => {
                ErrorKind::SessionStateError
            }
            InstallError::DirectoryNotFound(_) => ErrorKind::DirectoryNotFound,
            InstallError::PlatformUnsupported(_) => ErrorKind::PlatformUnsupported,
            InstallError::ScriptExecutionFailed { .. }
            | InstallError::ScriptMissing(_)
            | InstallError::TaskFailed(_) => ErrorKind::ScriptExecutionFailed,
            InstallError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Archive extraction errors
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Archive not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported archive format: {0}")]
    Unsupported(String),

    #[error("Corrupt archive: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_upload_lists_missing_chunks() {
        let err = UploadError::IncompleteUpload {
            missing: vec![1, 4, 7],
        };
        assert_eq!(err.to_string(), "Upload incomplete. Missing chunks: 1, 4, 7");
        assert_eq!(err.kind(), ErrorKind::IncompleteUpload);
    }

    #[test]
    fn test_error_kinds_follow_taxonomy() {
        assert_eq!(BsError::Unauthorized.kind(), ErrorKind::Unauthorized);
        assert_eq!(
            BsError::from(UploadError::ChecksumMismatch).kind(),
            ErrorKind::ChecksumMismatch
        );
        assert_eq!(
            BsError::from(UploadError::DecryptionFailed(CryptoError::DecryptionFailed)).kind(),
            ErrorKind::DecryptionFailed
        );
        assert_eq!(
            BsError::from(UploadError::InvalidSessionState {
                state: UploadState::Completed
            })
            .kind(),
            ErrorKind::SessionStateError
        );
        assert_eq!(
            BsError::from(InstallError::PlatformUnsupported("macos".into())).kind(),
            ErrorKind::PlatformUnsupported
        );
        assert_eq!(
            BsError::from(CryptoError::KeyNotFound).kind(),
            ErrorKind::DecryptionFailed
        );
    }

    #[test]
    fn test_script_failure_message() {
        let err = InstallError::ScriptExecutionFailed {
            script: "install.sh".into(),
            code: Some(2),
        };
        assert_eq!(err.to_string(), "Script 'install.sh' failed with exit code 2");

        let err = InstallError::ScriptExecutionFailed {
            script: "install.sh".into(),
            code: None,
        };
        assert!(err.to_string().ends_with("exit code none"));
    }
}
