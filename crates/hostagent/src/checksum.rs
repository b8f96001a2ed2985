//! Content checksums for host binaries.
//!
//! Binaries are identified by the lowercase hex SHA-1 of their full content.

use std::io;
use std::path::Path;

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path, source: io::Error) -> ChecksumError {
    let display = path.display().to_string();
    if source.kind() == io::ErrorKind::NotFound {
        ChecksumError::NotFound(display)
    } else {
        ChecksumError::Io {
            path: display,
            source,
        }
    }
}

/// Compute the lowercase hex SHA-1 of a file.
pub async fn compute_checksum(path: impl AsRef<Path>) -> Result<String, ChecksumError> {
    let path = path.as_ref();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_error(path, e))?;
    if metadata.is_dir() {
        return Err(ChecksumError::IsDirectory(path.display().to_string()));
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recompute the checksum of `path` and compare it with `expected`.
pub async fn verify_checksum(
    path: impl AsRef<Path>,
    expected: &str,
) -> Result<(), ChecksumError> {
    let path = path.as_ref();
    let actual = compute_checksum(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
