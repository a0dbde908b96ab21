use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use super::error::TransferError;

/// Everything the receiving side needs to know about an offered file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name, or path relative to the directory root for files that
    /// belong to a directory transfer.
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub checksum_algo: String,
    /// Hex digest of the whole file under `checksum_algo`.
    pub file_checksum: String,
    /// Last modification time, seconds since the epoch.
    pub mtime: u64,
}

impl FileMetadata {
    /// Builds metadata for a local file, streaming it once for the
    /// checksum.
    pub async fn from_file(
        path: &Path,
        filename: String,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(format!(
                "not a file: {}",
                path.display()
            )));
        }

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(Self {
            filename,
            file_size: meta.len(),
            chunk_size,
            total_chunks: chunk_count(meta.len(), chunk_size),
            checksum_algo: "sha1".to_string(),
            file_checksum: file_checksum(path).await?,
            mtime,
        })
    }

    /// Byte length of one chunk; only the final chunk may be short.
    pub fn chunk_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.chunk_size as u64;
        let remaining = self.file_size.saturating_sub(start);
        remaining.min(self.chunk_size as u64) as u32
    }

    pub fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }
}

/// `ceil(file_size / chunk_size)`; zero for empty files.
pub fn chunk_count(file_size: u64, chunk_size: u32) -> u32 {
    debug_assert!(chunk_size > 0);
    file_size.div_ceil(chunk_size as u64) as u32
}

/// Streaming SHA-1 of a file's contents, hex-encoded. The empty file
/// hashes to the digest of the empty sequence.
pub async fn file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of an in-memory buffer, hex-encoded.
pub fn buffer_checksum(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1, 1024), 1);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(10 * 1024, 1024), 10);
    }

    #[tokio::test]
    async fn test_metadata_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; 2500]).await.unwrap();

        let meta = FileMetadata::from_file(&path, "data.bin".into(), 1024)
            .await
            .unwrap();

        assert_eq!(meta.file_size, 2500);
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.chunk_len(0), 1024);
        assert_eq!(meta.chunk_len(1), 1024);
        assert_eq!(meta.chunk_len(2), 452);
        assert_eq!(meta.chunk_offset(2), 2048);
        assert_eq!(meta.file_checksum, buffer_checksum(&vec![7u8; 2500]));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_short_chunk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("even.bin");
        tokio::fs::write(&path, vec![1u8; 4096]).await.unwrap();

        let meta = FileMetadata::from_file(&path, "even.bin".into(), 1024)
            .await
            .unwrap();
        assert_eq!(meta.total_chunks, 4);
        assert_eq!(meta.chunk_len(3), 1024);
    }

    #[tokio::test]
    async fn test_empty_file_checksum() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        let meta = FileMetadata::from_file(&path, "empty".into(), 1024)
            .await
            .unwrap();
        assert_eq!(meta.total_chunks, 0);
        assert_eq!(meta.file_checksum, buffer_checksum(b""));
    }

    #[tokio::test]
    async fn test_metadata_rejects_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = FileMetadata::from_file(dir.path(), "x".into(), 1024).await;
        assert!(matches!(result, Err(TransferError::InvalidPath(_))));
    }
}
