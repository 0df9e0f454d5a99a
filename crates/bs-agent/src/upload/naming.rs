//! Sandbox directory and safe file name derivation

use std::path::{Component, Path, PathBuf};

use bs_core::config::UploadPolicy;
use bs_core::error::UploadError;
use bs_core::hash::sha256_hex;
use bs_core::ConnectionId;

/// Per-connection working directory: `<work_dir>/<sha256(connection id)>`
pub fn connection_dir(work_dir: &Path, id: &ConnectionId) -> PathBuf {
    work_dir.join(sha256_hex(id.as_str()))
}

/// Hash the sanitized stem and keep the matched suffix
///
/// `extension` is the suffix returned by the validator. The same input name
/// always maps to the same safe name, so a package archive named
/// `<id>.zip` lands in a folder named `sha256(<id>)` after extraction.
pub fn safe_file_name(file_name: &str, extension: &str, policy: &UploadPolicy) -> String {
    let stem = file_name
        .len()
        .checked_sub(extension.len())
        .and_then(|end| file_name.get(..end))
        .unwrap_or(file_name);

    let sanitized: String = stem
        .chars()
        .filter(|c| !c.is_control() && !policy.forbidden_chars.contains(c))
        .collect();

    format!("{}{}", sha256_hex(&sanitized), extension)
}

/// Strip the suffix from a safe name, giving the extraction folder name
pub fn safe_stem(safe_name: &str) -> &str {
    safe_name.split('.').next().unwrap_or(safe_name)
}

/// Join `name` onto `dir` and verify the result stays directly inside `dir`
pub fn resolve_within(dir: &Path, name: &str) -> Result<PathBuf, UploadError> {
    let candidate = dir.join(name);

    let mut components = Path::new(name).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal || candidate.parent() != Some(dir) {
        return Err(UploadError::InvalidFilePath(candidate));
    }

    Ok(candidate)
}
