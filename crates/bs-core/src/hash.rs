//! SHA-256 helpers for directory naming and content checksums

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Lowercase hex SHA-256 of a string
///
/// Used to derive per-connection and per-package directory names, so the
/// same input always maps to the same folder.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_bytes_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Stream a file through SHA-256
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Case-insensitive hex comparison, ignoring surrounding whitespace
pub fn checksum_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(sha256_hex("hello"), HELLO_SHA256);
        assert_eq!(sha256_bytes_hex(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn test_file_checksum_matches_in_memory_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();
        assert_eq!(file_checksum(file.path()).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_checksum_comparison_ignores_case() {
        assert!(checksum_matches(&HELLO_SHA256.to_uppercase(), HELLO_SHA256));
        assert!(!checksum_matches("deadbeef", HELLO_SHA256));
    }
}
