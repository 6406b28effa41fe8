//! Input discovery: find candidate files and fingerprint their bytes.
//!
//! Files are collected from every input directory, filtered by extension,
//! de-duplicated by canonical path (the same directory may be listed twice,
//! or nested inside another when `recursive` is set) and returned in
//! lexicographic path order so runs are deterministic.

use crate::config::PipelineConfig;
use crate::error::{DocumentError, InvoiceError};
use crate::model::NewDocument;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// List candidate files under the configured input directories.
///
/// A missing input directory is fatal, a missing optional one is skipped.
/// Unreadable entries inside an existing directory are logged and skipped.
pub fn discover_files(config: &PipelineConfig) -> Result<Vec<PathBuf>, InvoiceError> {
    let mut found = BTreeSet::new();

    for dir in &config.input_dirs {
        if !dir.is_dir() {
            return Err(InvoiceError::InputDirNotFound { path: dir.clone() });
        }
    }
    let optional = config.optional_input_dirs.iter().filter(|dir| {
        let present = dir.is_dir();
        if !present {
            debug!("Optional input directory {} not present", dir.display());
        }
        present
    });

    for dir in config.input_dirs.iter().chain(optional) {

        let max_depth = if config.recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(dir).max_depth(max_depth) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !config.accepts_extension(entry.path()) {
                continue;
            }
            let path = std::fs::canonicalize(entry.path())
                .unwrap_or_else(|_| entry.path().to_path_buf());
            found.insert(path);
        }
    }

    debug!("Discovered {} candidate files", found.len());
    Ok(found.into_iter().collect())
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// MIME type sniffed from the leading bytes.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        return "application/pdf";
    }
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Read a file and describe it for [`crate::store::Store::record_document`].
pub async fn describe_file(path: &Path) -> Result<(NewDocument, Vec<u8>), DocumentError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| DocumentError::Io {
        detail: format!("cannot read '{}': {}", path.display(), e),
    })?;

    let doc = NewDocument {
        path: path.to_path_buf(),
        fingerprint: fingerprint(&bytes),
        byte_size: bytes.len() as u64,
        mime: sniff_mime(&bytes).to_string(),
    };
    Ok((doc, bytes))
}
