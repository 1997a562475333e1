use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Result of comparing a local file against the engine's sha256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ChecksumStatus {
    Match,
    Mismatch { expected: String, actual: String },
    /// The engine has not hashed this file yet
    Unknown,
}

/// Streams the file through SHA-256 and returns the lowercase hex digest.
pub(crate) async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024]; // 1MB buffer

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) async fn compare_checksum(
    path: &Path,
    expected: Option<&str>,
) -> std::io::Result<ChecksumStatus> {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        debug!("No remote sha256 for {:?}", path);
        return Ok(ChecksumStatus::Unknown);
    };

    let actual = sha256_file(path).await?;
    if actual.eq_ignore_ascii_case(expected) {
        info!("Checksum verified for {:?}", path);
        Ok(ChecksumStatus::Match)
    } else {
        Ok(ChecksumStatus::Mismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // sha256("hello")
    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[tokio::test]
    async fn test_compare_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.safetensors");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            compare_checksum(&path, Some(&HELLO.to_uppercase())).await.unwrap(),
            ChecksumStatus::Match
        );
        assert_eq!(
            compare_checksum(&path, None).await.unwrap(),
            ChecksumStatus::Unknown
        );
        match compare_checksum(&path, Some("00")).await.unwrap() {
            ChecksumStatus::Mismatch { actual, .. } => assert_eq!(actual, HELLO),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(compare_checksum(&dir.path().join("x"), Some(HELLO)).await.is_err());
    }
}
