//! Source validation: make sure the job's input is a readable PDF.
//!
//! Checking the `%PDF` magic bytes up front turns a confusing pdfium failure
//! deep inside the first page render into a clear error before the job's
//! event log is even opened.

use crate::error::TranscriberError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve `path` to an absolute, readable PDF file.
pub fn validate_source(path: &Path) -> Result<PathBuf, TranscriberError> {
    if !path.is_file() {
        return Err(TranscriberError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut file = File::open(path).map_err(|_| TranscriberError::FileNotFound {
        path: path.to_path_buf(),
    })?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || &magic != b"%PDF" {
        return Err(TranscriberError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }

    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    debug!("Resolved source PDF: {}", resolved.display());
    Ok(resolved)
}
