//! Archive extraction
//!
//! A verified upload is unpacked next to itself, into a folder named after
//! the safe file name's stem. The format is sniffed from magic bytes rather
//! than trusted from the suffix, so a `.bundle` that is really a zip works.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use zip::ZipArchive;

use bs_core::error::ExtractionError;

/// Result of a successful extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub destination: PathBuf,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Unpacks a verified upload
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<ExtractionSummary, ExtractionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

/// Zip, tar and gzip'd tar support
#[derive(Debug, Default, Clone)]
pub struct ArchiveExtractor;

impl ArchiveExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extractor for ArchiveExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<ExtractionSummary, ExtractionError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
            .await
            .map_err(|e| ExtractionError::Archive(format!("extraction task failed: {}", e)))?
    }
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<ExtractionSummary, ExtractionError> {
    if !archive.is_file() {
        return Err(ExtractionError::NotFound(archive.to_path_buf()));
    }

    let kind = sniff(archive)?;
    std::fs::create_dir_all(dest)?;
    tracing::info!("Extracting {:?} archive {:?} into {:?}", kind, archive, dest);

    match kind {
        ArchiveKind::Zip => {
            let file = File::open(archive)?;
            let mut zip =
                ZipArchive::new(file).map_err(|e| ExtractionError::Archive(e.to_string()))?;
            zip.extract(dest)
                .map_err(|e| ExtractionError::Archive(e.to_string()))?;
        }
        ArchiveKind::TarGz => {
            let file = File::open(archive)?;
            Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .map_err(|e| ExtractionError::Archive(e.to_string()))?;
        }
        ArchiveKind::Tar => {
            let file = File::open(archive)?;
            Archive::new(file)
                .unpack(dest)
                .map_err(|e| ExtractionError::Archive(e.to_string()))?;
        }
    }

    let (file_count, total_bytes) = tally(dest)?;
    tracing::info!(
        "Extracted {} files ({} bytes) into {:?}",
        file_count,
        total_bytes,
        dest
    );

    Ok(ExtractionSummary {
        destination: dest.to_path_buf(),
        file_count,
        total_bytes,
    })
}

fn sniff(archive: &Path) -> Result<ArchiveKind, ExtractionError> {
    let mut header = [0u8; 512];
    let mut file = File::open(archive)?;
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let header = &header[..filled];

    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        Ok(ArchiveKind::Zip)
    } else if header.starts_with(&[0x1f, 0x8b]) {
        Ok(ArchiveKind::TarGz)
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        Ok(ArchiveKind::Tar)
    } else {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(ExtractionError::Unsupported(name))
    }
}

/// Count regular files and their total size under `root`
fn tally(root: &Path) -> std::io::Result<(usize, u64)> {
    let mut count = 0;
    let mut bytes = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                count += 1;
                bytes += entry.metadata()?.len();
            }
        }
    }
    Ok((count, bytes))
}
