//! Chunked file and directory transfer.
//!
//! Layered over the peer session protocol as the reserved `file_*` /
//! `dir_*` message space. Control messages (offer, accept, acks, pause,
//! resume, cancel, complete, manifests) are JSON control frames; chunk
//! payloads ride binary frames carrying a CRC32C each.
//!
//! A sending transfer keeps a window of at most sixteen unacknowledged
//! chunks in flight, retransmits chunks whose acks go missing, and
//! announces a whole-file checksum at the end; the receiving side writes
//! verified chunks at their offsets and accepts the file only once the
//! final checksum matches. Directory transfers exchange a manifest and
//! run their member files as parallel transfers under a concurrency cap.

mod directory;
mod engine;
mod error;
mod message;
mod metadata;
mod progress;

pub use directory::{DirDirection, DirectoryProgress};
pub use engine::{FileTransferManager, TransferConfig};
pub use error::TransferError;
pub use message::{ChunkFrame, ControlMessage, ManifestEntry};
pub use metadata::{chunk_count, file_checksum, FileMetadata};
pub use progress::{TransferDirection, TransferProgress, TransferStatus};

#[cfg(test)]
mod tests;
