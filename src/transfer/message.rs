use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TransferError;
use super::metadata::FileMetadata;

/// One entry of a directory manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the directory root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    /// Hex SHA-1 of the file; empty for directories.
    pub checksum: String,
    pub is_dir: bool,
}

/// Transfer control messages, carried as JSON control frames.
///
/// The serde tag is the frame's top-level `type`, which keeps the whole
/// family inside the reserved `file_*` / `dir_*` dispatch space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    FileOffer {
        transfer_id: Uuid,
        metadata: FileMetadata,
        /// Present when the file is one member of a directory transfer.
        #[serde(skip_serializing_if = "Option::is_none")]
        dir_transfer_id: Option<Uuid>,
    },
    FileAccept {
        transfer_id: Uuid,
    },
    FileReject {
        transfer_id: Uuid,
        reason: String,
    },
    FileChunkAck {
        transfer_id: Uuid,
        index: u32,
    },
    FileChunkNack {
        transfer_id: Uuid,
        index: u32,
    },
    FilePause {
        transfer_id: Uuid,
    },
    FileResume {
        transfer_id: Uuid,
        /// Where the sender should rewind to; the receiver's lowest
        /// missing chunk index.
        first_missing_index: u32,
    },
    FileCancel {
        transfer_id: Uuid,
    },
    FileComplete {
        transfer_id: Uuid,
        file_checksum: String,
    },
    FileRequest {
        transfer_id: Uuid,
        remote_path: String,
    },
    DirOffer {
        transfer_id: Uuid,
        directory_name: String,
        total_files: u64,
        total_bytes: u64,
        recursive: bool,
    },
    DirAccept {
        transfer_id: Uuid,
    },
    DirReject {
        transfer_id: Uuid,
        reason: String,
    },
    DirManifest {
        transfer_id: Uuid,
        entries: Vec<ManifestEntry>,
    },
    DirRequest {
        transfer_id: Uuid,
        remote_path: String,
        recursive: bool,
    },
    DirComplete {
        transfer_id: Uuid,
    },
}

impl ControlMessage {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("control message serializes")
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, TransferError> {
        serde_json::from_value(value)
            .map_err(|e| TransferError::Protocol(format!("bad control message: {}", e)))
    }
}

/// A binary chunk frame payload.
///
/// Layout: 4-byte big-endian transfer id length, the id bytes (hyphenated
/// UUID ASCII), 4-byte big-endian chunk index, 4-byte big-endian CRC32C
/// of the data, then the chunk data.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub transfer_id: Uuid,
    pub index: u32,
    pub crc: u32,
    pub data: Bytes,
}

impl ChunkFrame {
    pub fn new(transfer_id: Uuid, index: u32, data: Bytes) -> Self {
        let crc = crc32c::crc32c(&data);
        Self {
            transfer_id,
            index,
            crc,
            data,
        }
    }

    /// Whether the carried CRC matches the data.
    pub fn verify(&self) -> bool {
        crc32c::crc32c(&self.data) == self.crc
    }

    pub fn encode(&self) -> Bytes {
        let id = self.transfer_id.to_string();
        let mut buf = BytesMut::with_capacity(4 + id.len() + 8 + self.data.len());
        buf.put_u32(id.len() as u32);
        buf.put_slice(id.as_bytes());
        buf.put_u32(self.index);
        buf.put_u32(self.crc);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, TransferError> {
        if payload.len() < 4 {
            return Err(TransferError::Protocol("chunk frame truncated".into()));
        }
        let id_len = payload.get_u32() as usize;
        if id_len > 64 || payload.len() < id_len + 8 {
            return Err(TransferError::Protocol("chunk frame truncated".into()));
        }

        let id_bytes = payload.split_to(id_len);
        let transfer_id = std::str::from_utf8(&id_bytes)
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| TransferError::Protocol("bad transfer id in chunk".into()))?;

        let index = payload.get_u32();
        let crc = payload.get_u32();

        Ok(Self {
            transfer_id,
            index,
            crc,
            data: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_tag_names() {
        let msg = ControlMessage::FileAccept {
            transfer_id: Uuid::new_v4(),
        };
        let value = msg.to_value();
        assert_eq!(value["type"], "file_accept");

        let msg = ControlMessage::DirManifest {
            transfer_id: Uuid::new_v4(),
            entries: vec![],
        };
        assert_eq!(msg.to_value()["type"], "dir_manifest");
    }

    #[test]
    fn test_control_message_roundtrip() {
        let original = ControlMessage::FileResume {
            transfer_id: Uuid::new_v4(),
            first_missing_index: 37,
        };
        let parsed = ControlMessage::from_value(original.to_value()).unwrap();
        let ControlMessage::FileResume { first_missing_index, .. } = parsed else {
            panic!("wrong variant");
        };
        assert_eq!(first_missing_index, 37);
    }

    #[test]
    fn test_control_message_rejects_unknown_type() {
        let value = serde_json::json!({ "type": "file_explode", "transfer_id": "x" });
        assert!(ControlMessage::from_value(value).is_err());
    }

    #[test]
    fn test_chunk_frame_roundtrip() {
        let id = Uuid::new_v4();
        let frame = ChunkFrame::new(id, 42, Bytes::from_static(b"chunk data here"));
        let decoded = ChunkFrame::decode(frame.encode()).unwrap();

        assert_eq!(decoded.transfer_id, id);
        assert_eq!(decoded.index, 42);
        assert_eq!(decoded.data, Bytes::from_static(b"chunk data here"));
        assert!(decoded.verify());
    }

    #[test]
    fn test_chunk_frame_detects_corruption() {
        let frame = ChunkFrame::new(Uuid::new_v4(), 0, Bytes::from_static(b"payload"));
        let mut encoded = BytesMut::from(&frame.encode()[..]);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let decoded = ChunkFrame::decode(encoded.freeze()).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn test_chunk_frame_rejects_truncation() {
        assert!(ChunkFrame::decode(Bytes::from_static(b"\x00\x00")).is_err());
        assert!(ChunkFrame::decode(Bytes::from_static(b"\x00\x00\x00\x24abc")).is_err());
    }

    #[test]
    fn test_empty_chunk_is_valid() {
        let frame = ChunkFrame::new(Uuid::new_v4(), 0, Bytes::new());
        let decoded = ChunkFrame::decode(frame.encode()).unwrap();
        assert!(decoded.verify());
        assert!(decoded.data.is_empty());
    }
}
