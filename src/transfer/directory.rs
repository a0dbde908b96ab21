use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use uuid::Uuid;

use super::error::TransferError;
use super::message::ManifestEntry;
use super::metadata::file_checksum;
use super::progress::TransferStatus;
use crate::peer::PeerId;

/// Which way a directory transfer flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirDirection {
    Sending,
    Receiving,
}

/// Aggregate progress for a directory transfer, handed to the directory
/// progress callback.
#[derive(Debug, Clone)]
pub struct DirectoryProgress {
    pub dir_transfer_id: Uuid,
    pub peer_id: PeerId,
    pub status: TransferStatus,
    /// The directory's name on the offering side.
    pub directory_name: String,
    pub recursive: bool,
    /// Relative path of the file most recently started.
    pub current_file: String,
    pub files_completed: u64,
    pub files_failed: u64,
    pub total_files: u64,
    pub bytes_completed: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
}

pub(super) struct DirState {
    entries: Vec<ManifestEntry>,
    status: TransferStatus,
    current_file: String,
    files_completed: u64,
    files_failed: u64,
    total_files: u64,
    bytes_completed: u64,
    total_bytes: u64,
    error: Option<String>,
}

/// One directory transfer: the manifest plus aggregate counters over its
/// member file transfers.
pub(super) struct DirTransfer {
    pub id: Uuid,
    pub peer_id: PeerId,
    pub direction: DirDirection,
    pub root_local: PathBuf,
    pub remote_name: String,
    pub recursive: bool,
    state: Mutex<DirState>,
}

impl DirTransfer {
    pub fn new(
        id: Uuid,
        peer_id: PeerId,
        direction: DirDirection,
        root_local: PathBuf,
        remote_name: String,
        recursive: bool,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            id,
            peer_id,
            direction,
            root_local,
            remote_name,
            recursive,
            state: Mutex::new(DirState {
                entries: Vec::new(),
                status: TransferStatus::Starting,
                current_file: String::new(),
                files_completed: 0,
                files_failed: 0,
                total_files: 0,
                bytes_completed: 0,
                total_bytes: 0,
                error: None,
            }),
        })
    }

    pub fn set_entries(&self, entries: &[ManifestEntry]) {
        let mut st = self.state.lock();
        st.entries = entries.to_vec();
        st.total_files = entries.iter().filter(|e| !e.is_dir).count() as u64;
        st.total_bytes = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        if st.status == TransferStatus::Starting {
            st.status = TransferStatus::InProgress;
        }
    }

    /// Totals from the offer, available before the manifest arrives.
    pub fn set_expected_totals(&self, total_files: u64, total_bytes: u64) {
        let mut st = self.state.lock();
        if st.entries.is_empty() {
            st.total_files = total_files;
            st.total_bytes = total_bytes;
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        let st = self.state.lock();
        (st.total_files, st.total_bytes)
    }

    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.state.lock().entries.clone()
    }

    /// The manifest's file entries, directories excluded.
    pub fn file_entries(&self) -> Vec<ManifestEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| !e.is_dir)
            .cloned()
            .collect()
    }

    pub fn set_current_file(&self, relative: &str) {
        self.state.lock().current_file = relative.to_string();
    }

    pub fn record_member_done(&self, size: u64, success: bool) {
        let mut st = self.state.lock();
        if success {
            st.files_completed += 1;
            st.bytes_completed += size;
        } else {
            st.files_failed += 1;
        }
    }

    pub fn all_members_done(&self) -> bool {
        let st = self.state.lock();
        st.files_completed + st.files_failed >= st.total_files
    }

    /// Moves to the terminal status. Returns the failed-member count on
    /// the transition, `None` if the transfer was already terminal.
    pub fn finish(&self) -> Option<u64> {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            return None;
        }
        st.status = if st.files_failed == 0 {
            TransferStatus::Completed
        } else {
            TransferStatus::Failed
        };
        if st.files_failed > 0 {
            st.error = Some(format!("{} file(s) failed", st.files_failed));
        }
        Some(st.files_failed)
    }

    pub fn fail(&self, reason: &str) {
        let mut st = self.state.lock();
        if !st.status.is_terminal() {
            st.status = TransferStatus::Failed;
            st.error = Some(reason.to_string());
        }
    }

    pub fn snapshot(&self) -> DirectoryProgress {
        let st = self.state.lock();
        DirectoryProgress {
            dir_transfer_id: self.id,
            peer_id: self.peer_id,
            status: st.status,
            directory_name: self.remote_name.clone(),
            recursive: self.recursive,
            current_file: st.current_file.clone(),
            files_completed: st.files_completed,
            files_failed: st.files_failed,
            total_files: st.total_files,
            bytes_completed: st.bytes_completed,
            total_bytes: st.total_bytes,
            error: st.error.clone(),
        }
    }
}

/// Walks a directory into a manifest of `/`-separated relative paths.
///
/// Directories come before their contents so the receiver can pre-create
/// the skeleton in order. File checksums are computed here, streaming
/// each file once.
pub(super) async fn build_manifest(
    root: &Path,
    recursive: bool,
) -> Result<Vec<ManifestEntry>, TransferError> {
    let meta = tokio::fs::metadata(root).await?;
    if !meta.is_dir() {
        return Err(TransferError::InvalidPath(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::new();
    queue.push_back(root.to_path_buf());

    while let Some(dir) = queue.pop_front() {
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = reader.next_entry().await? {
            let path = item.path();
            let file_type = item.file_type().await?;
            let relative = path
                .strip_prefix(root)
                .map_err(|_| TransferError::InvalidPath(format!("{}", path.display())))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if file_type.is_dir() {
                entries.push(ManifestEntry {
                    relative_path: relative,
                    size: 0,
                    checksum: String::new(),
                    is_dir: true,
                });
                if recursive {
                    queue.push_back(path);
                }
            } else if file_type.is_file() {
                let size = item.metadata().await?.len();
                entries.push(ManifestEntry {
                    relative_path: relative,
                    size,
                    checksum: file_checksum(&path).await?,
                    is_dir: false,
                });
            }
            // Symlinks and special files are skipped.
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        tokio::fs::write(root.join("a.txt"), b"alpha").await.unwrap();
        tokio::fs::create_dir(root.join("sub")).await.unwrap();
        tokio::fs::write(root.join("sub/b.bin"), vec![9u8; 300])
            .await
            .unwrap();
        tokio::fs::create_dir(root.join("empty")).await.unwrap();
        dir
    }

    #[tokio::test]
    async fn test_manifest_recursive() {
        let dir = sample_tree().await;
        let mut entries = build_manifest(dir.path(), true).await.unwrap();
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let paths: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(paths, ["a.txt", "empty", "sub", "sub/b.bin"]);

        let file = entries.iter().find(|e| e.relative_path == "sub/b.bin").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.size, 300);
        assert_eq!(file.checksum.len(), 40);

        let sub = entries.iter().find(|e| e.relative_path == "sub").unwrap();
        assert!(sub.is_dir);
        assert!(sub.checksum.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_non_recursive() {
        let dir = sample_tree().await;
        let entries = build_manifest(dir.path(), false).await.unwrap();

        assert!(entries.iter().any(|e| e.relative_path == "sub" && e.is_dir));
        assert!(!entries.iter().any(|e| e.relative_path == "sub/b.bin"));
    }

    #[tokio::test]
    async fn test_manifest_rejects_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f");
        tokio::fs::write(&file, b"x").await.unwrap();
        assert!(matches!(
            build_manifest(&file, true).await,
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_dir_counters() {
        let dir = DirTransfer::new(
            Uuid::new_v4(),
            crate::peer::PeerId::generate(),
            DirDirection::Sending,
            PathBuf::from("/tmp/x"),
            "x".into(),
            true,
        );
        dir.set_entries(&[
            ManifestEntry {
                relative_path: "a".into(),
                size: 100,
                checksum: "00".into(),
                is_dir: false,
            },
            ManifestEntry {
                relative_path: "d".into(),
                size: 0,
                checksum: String::new(),
                is_dir: true,
            },
            ManifestEntry {
                relative_path: "d/b".into(),
                size: 50,
                checksum: "11".into(),
                is_dir: false,
            },
        ]);

        assert_eq!(dir.totals(), (2, 150));
        assert!(!dir.all_members_done());

        dir.record_member_done(100, true);
        dir.record_member_done(50, false);
        assert!(dir.all_members_done());

        assert_eq!(dir.finish(), Some(1));
        assert_eq!(dir.finish(), None);
        let snap = dir.snapshot();
        assert_eq!(snap.status, TransferStatus::Failed);
        assert_eq!(snap.files_completed, 1);
        assert_eq!(snap.bytes_completed, 100);
    }
}
