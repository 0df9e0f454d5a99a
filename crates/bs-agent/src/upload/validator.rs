//! Structural checks on upload metadata
//!
//! Pure functions over an [`UploadPolicy`]. Checksum equality at the end of
//! the transfer is the final word on content; these only gate what a session
//! may be opened for.

use bs_core::config::UploadPolicy;
use bs_core::error::ValidationError;
use bs_core::rpc::UploadMetadata;

/// Validate a file name and return the allow-listed suffix it ends with
///
/// The longest matching suffix wins, so `bundle.tar.gz` yields `.tar.gz`.
/// The returned suffix is lowercased.
pub fn validate_file_name(name: &str, policy: &UploadPolicy) -> Result<String, ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::InvalidFileName(
            "file name is empty".to_string(),
        ));
    }
    if name.chars().count() > policy.max_file_name_len {
        return Err(ValidationError::InvalidFileName(format!(
            "file name exceeds {} characters",
            policy.max_file_name_len
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || policy.forbidden_chars.contains(c))
    {
        return Err(ValidationError::InvalidFileName(format!(
            "forbidden character {:?}",
            c
        )));
    }

    let lower = name.to_lowercase();
    policy
        .allowed_extensions
        .iter()
        .map(|ext| ext.to_lowercase())
        .filter(|ext| lower.ends_with(ext.as_str()))
        .max_by_key(|ext| ext.len())
        .ok_or_else(|| ValidationError::UnsupportedFileType(name.to_string()))
}

pub fn validate_file_size(size: u64, policy: &UploadPolicy) -> Result<(), ValidationError> {
    if size == 0 || size > policy.max_file_size {
        return Err(ValidationError::InvalidFileSize {
            size,
            max: policy.max_file_size,
        });
    }
    Ok(())
}

pub fn validate_chunk_size(size: u64, policy: &UploadPolicy) -> Result<(), ValidationError> {
    if size == 0 || size > policy.max_chunk_size {
        return Err(ValidationError::InvalidChunkSize {
            size,
            max: policy.max_chunk_size,
        });
    }
    Ok(())
}

/// Run every metadata check; returns the matched suffix on success
pub fn validate_metadata(
    meta: &UploadMetadata,
    policy: &UploadPolicy,
) -> Result<String, ValidationError> {
    let extension = validate_file_name(&meta.file_name, policy)?;
    validate_file_size(meta.file_size, policy)?;
    validate_chunk_size(meta.chunk_size, policy)?;
    if meta.expected_checksum.trim().is_empty() {
        return Err(ValidationError::MissingChecksum);
    }
    Ok(extension)
}
