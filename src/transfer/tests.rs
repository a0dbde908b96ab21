use super::*;
use crate::peer::PeerClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

struct Node {
    client: Arc<PeerClient>,
    engine: Arc<FileTransferManager>,
    downloads: TempDir,
    completions: Mutex<mpsc::UnboundedReceiver<(Uuid, bool, Option<String>)>>,
}

impl Node {
    async fn spawn(chunk_size: u32) -> Self {
        let downloads = TempDir::new().unwrap();
        let client = PeerClient::new();
        client.start(0).await.unwrap();

        let engine = FileTransferManager::new(
            client.clone(),
            TransferConfig {
                chunk_size,
                download_dir: downloads.path().to_path_buf(),
                ..TransferConfig::default()
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        engine.on_completion(move |id, success, error| {
            let _ = tx.send((id, success, error));
        });

        Self {
            client,
            engine,
            downloads,
            completions: Mutex::new(rx),
        }
    }

    async fn next_completion(&self) -> (Uuid, bool, Option<String>) {
        let mut rx = self.completions.lock().await;
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("completion within deadline")
            .expect("completion channel open")
    }

    async fn stop(self) {
        self.engine.shutdown();
        self.client.stop().await;
    }
}

async fn connected_pair(chunk_size: u32) -> (Node, Node) {
    let a = Node::spawn(chunk_size).await;
    let b = Node::spawn(chunk_size).await;

    b.client
        .connect_to_peer("127.0.0.1", a.client.listen_port())
        .await
        .unwrap();

    for _ in 0..100 {
        if a.client.get_peer_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(a.client.get_peer_count(), 1);

    (a, b)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) ^ (i >> 8)) as u8).collect()
}

async fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

#[tokio::test]
async fn test_file_roundtrip() {
    let (a, b) = connected_pair(16 * 1024).await;
    let b_id = b.client.local_peer_id();

    let data = patterned(300 * 1024);
    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "payload.bin", &data).await;

    let progress_ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let ticks = progress_ticks.clone();
    a.engine.on_progress(move |_| {
        ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let id = a.engine.send_file(b_id, &path).await.unwrap();

    let (done_id, success, error) = a.next_completion().await;
    assert_eq!(done_id, id);
    assert!(success, "sender failed: {:?}", error);

    let (_, success, error) = b.next_completion().await;
    assert!(success, "receiver failed: {:?}", error);

    let received = tokio::fs::read(b.downloads.path().join("payload.bin"))
        .await
        .unwrap();
    assert_eq!(received, data);

    // 300 KiB / 16 KiB = 19 chunks; at least one progress event each.
    assert!(progress_ticks.load(std::sync::atomic::Ordering::SeqCst) >= 10);

    let snap = a.engine.transfer_progress(id).unwrap();
    assert_eq!(snap.status, TransferStatus::Completed);
    assert_eq!(snap.bytes_transferred, data.len() as u64);
    assert_eq!(snap.chunks_completed, snap.total_chunks);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_empty_file_transfers() {
    let (a, b) = connected_pair(16 * 1024).await;
    let b_id = b.client.local_peer_id();

    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "empty.bin", b"").await;

    let id = a.engine.send_file(b_id, &path).await.unwrap();

    let (_, success, _) = a.next_completion().await;
    assert!(success);
    let (_, success, _) = b.next_completion().await;
    assert!(success);

    let snap = a.engine.transfer_progress(id).unwrap();
    assert_eq!(snap.total_chunks, 0);
    assert_eq!(snap.bytes_transferred, 0);

    let meta = tokio::fs::metadata(b.downloads.path().join("empty.bin"))
        .await
        .unwrap();
    assert_eq!(meta.len(), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_exact_chunk_multiple() {
    let (a, b) = connected_pair(4 * 1024).await;
    let b_id = b.client.local_peer_id();

    let data = patterned(8 * 4 * 1024);
    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "even.bin", &data).await;

    let id = a.engine.send_file(b_id, &path).await.unwrap();
    let (_, success, _) = a.next_completion().await;
    assert!(success);

    let snap = a.engine.transfer_progress(id).unwrap();
    assert_eq!(snap.total_chunks, 8);

    let (_, success, _) = b.next_completion().await;
    assert!(success);
    let received = tokio::fs::read(b.downloads.path().join("even.bin"))
        .await
        .unwrap();
    assert_eq!(received, data);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_pause_resume() {
    let (a, b) = connected_pair(1024).await;
    let b_id = b.client.local_peer_id();

    let data = patterned(512 * 1024);
    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "big.bin", &data).await;

    // Pause from the sender once a slice of the file is acked.
    let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let engine = a.engine.clone();
    let pause_flag = paused.clone();
    a.engine.on_progress(move |p| {
        if p.direction == TransferDirection::Sending
            && p.chunks_completed >= 20
            && !pause_flag.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = engine.pause_transfer(p.transfer_id);
        }
    });

    let id = a.engine.send_file(b_id, &path).await.unwrap();

    for _ in 0..200 {
        if a.engine.transfer_progress(id).unwrap().status == TransferStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        a.engine.transfer_progress(id).unwrap().status,
        TransferStatus::Paused
    );

    // With the window drained, no further bytes move while paused.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let before = b.engine.transfer_progress(id).unwrap().bytes_transferred;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = b.engine.transfer_progress(id).unwrap().bytes_transferred;
    assert_eq!(before, after, "chunks kept flowing while paused");
    assert!(after < data.len() as u64);

    // The receiver resumes with its first missing index.
    b.engine.resume_transfer(id).unwrap();

    let (_, success, error) = a.next_completion().await;
    assert!(success, "sender failed: {:?}", error);
    let (_, success, error) = b.next_completion().await;
    assert!(success, "receiver failed: {:?}", error);

    let received = tokio::fs::read(b.downloads.path().join("big.bin"))
        .await
        .unwrap();
    assert_eq!(received, data);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_cancel_is_terminal() {
    let (a, b) = connected_pair(1024).await;
    let b_id = b.client.local_peer_id();

    let data = patterned(256 * 1024);
    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "doomed.bin", &data).await;

    // Freeze the transfer immediately so there is something to cancel.
    let engine = a.engine.clone();
    let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pause_flag = paused.clone();
    a.engine.on_progress(move |p| {
        if p.direction == TransferDirection::Sending
            && !pause_flag.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = engine.pause_transfer(p.transfer_id);
        }
    });

    let id = a.engine.send_file(b_id, &path).await.unwrap();

    for _ in 0..200 {
        if a.engine.transfer_progress(id).unwrap().status == TransferStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    a.engine.cancel_transfer(id).unwrap();

    let (_, success, error) = a.next_completion().await;
    assert!(!success);
    assert_eq!(error.as_deref(), Some("cancelled"));

    let (_, success, _) = b.next_completion().await;
    assert!(!success);

    // Terminal: the status cannot move again.
    assert_eq!(
        a.engine.transfer_progress(id).unwrap().status,
        TransferStatus::Cancelled
    );
    assert!(a.engine.resume_transfer(id).is_err());
    assert_eq!(
        a.engine.transfer_progress(id).unwrap().status,
        TransferStatus::Cancelled
    );

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_offer_rejection_fails_sender() {
    let (a, b) = connected_pair(16 * 1024).await;
    let b_id = b.client.local_peer_id();

    b.engine.on_transfer_request(|_, _, _| false);

    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "unwanted.bin", &patterned(1024)).await;

    let id = a.engine.send_file(b_id, &path).await.unwrap();

    let (done_id, success, error) = a.next_completion().await;
    assert_eq!(done_id, id);
    assert!(!success);
    assert!(error.unwrap_or_default().contains("rejected"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_request_file_pull() {
    let (a, b) = connected_pair(8 * 1024).await;
    let a_id = a.client.local_peer_id();

    let data = patterned(100 * 1024);
    let src = TempDir::new().unwrap();
    let remote = write_file(src.path(), "served.bin", &data).await;

    let local = b.downloads.path().join("fetched.bin");
    let id = b
        .engine
        .request_file(a_id, remote.to_str().unwrap(), &local)
        .await
        .unwrap();

    let (done_id, success, error) = b.next_completion().await;
    assert_eq!(done_id, id);
    assert!(success, "pull failed: {:?}", error);

    let received = tokio::fs::read(&local).await.unwrap();
    assert_eq!(received, data);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_directory_transfer() {
    let (a, b) = connected_pair(4 * 1024).await;
    let b_id = b.client.local_peer_id();

    let src = TempDir::new().unwrap();
    let root = src.path().join("album");
    tokio::fs::create_dir(&root).await.unwrap();
    tokio::fs::write(root.join("one.txt"), patterned(5000))
        .await
        .unwrap();
    tokio::fs::create_dir(root.join("nested")).await.unwrap();
    tokio::fs::write(root.join("nested/two.bin"), patterned(20_000))
        .await
        .unwrap();

    let (dir_tx, mut dir_rx) = mpsc::unbounded_channel();
    b.engine.on_directory_progress(move |p| {
        let _ = dir_tx.send((p.status, p.files_completed, p.total_files));
    });

    let dir_id = a.engine.send_directory(b_id, &root, true).await.unwrap();

    // Two member completions on each side.
    let (_, ok1, _) = b.next_completion().await;
    let (_, ok2, _) = b.next_completion().await;
    assert!(ok1 && ok2);

    let mut final_state = None;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(5), dir_rx.recv()).await
    {
        if event.0 == TransferStatus::Completed {
            final_state = Some(event);
            break;
        }
    }
    let (_, files_completed, total_files) = final_state.expect("directory completed");
    assert_eq!(files_completed, 2);
    assert_eq!(total_files, 2);

    let received_root = b.downloads.path().join("album");
    let one = tokio::fs::read(received_root.join("one.txt")).await.unwrap();
    assert_eq!(one, patterned(5000));
    let two = tokio::fs::read(received_root.join("nested/two.bin"))
        .await
        .unwrap();
    assert_eq!(two, patterned(20_000));

    let snap = a.engine.directory_progress(dir_id).unwrap();
    assert_eq!(snap.status, TransferStatus::Completed);
    assert_eq!(snap.bytes_completed, 25_000);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_peer_loss_fails_transfer() {
    let (a, b) = connected_pair(1024).await;
    let b_id = b.client.local_peer_id();

    let data = patterned(256 * 1024);
    let src = TempDir::new().unwrap();
    let path = write_file(src.path(), "orphan.bin", &data).await;

    // Park the transfer so it is alive when the peer goes away.
    let engine = a.engine.clone();
    let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pause_flag = paused.clone();
    a.engine.on_progress(move |p| {
        if p.direction == TransferDirection::Sending
            && !pause_flag.swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            let _ = engine.pause_transfer(p.transfer_id);
        }
    });

    let id = a.engine.send_file(b_id, &path).await.unwrap();
    for _ in 0..200 {
        if a.engine.transfer_progress(id).unwrap().status == TransferStatus::Paused {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    b.client.stop().await;

    let (done_id, success, error) = a.next_completion().await;
    assert_eq!(done_id, id);
    assert!(!success);
    assert!(error.unwrap_or_default().contains("disconnected"));
    assert_eq!(
        a.engine.transfer_progress(id).unwrap().status,
        TransferStatus::Failed
    );

    a.stop().await;
    b.engine.shutdown();
}
