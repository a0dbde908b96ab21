use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::error::PeerError;
use crate::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Frame kind byte, the first payload byte after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// UTF-8 JSON control payload.
    Control = 0x00,
    /// Binary chunk payload.
    Binary = 0x01,
}

impl TryFrom<u8> for FrameKind {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Control),
            0x01 => Ok(FrameKind::Binary),
            other => Err(PeerError::Protocol(format!(
                "unknown frame kind: {:#04x}",
                other
            ))),
        }
    }
}

/// One wire frame: a kind byte plus its payload.
///
/// On the wire this is a 4-byte big-endian total length N (kind byte plus
/// payload, 1 <= N <= 16 MiB), the kind byte, then N-1 payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Control,
            payload,
        }
    }

    pub fn binary(payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Binary,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let total = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + total);
        buf.put_u32(total as u32);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes one frame from the front of `buf`, if complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumes the frame
    /// from `buf` on success.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, PeerError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total == 0 {
            return Err(PeerError::Protocol("zero-length frame".into()));
        }
        if total > MAX_FRAME_SIZE {
            return Err(PeerError::Protocol(format!("frame too large: {}", total)));
        }

        if buf.len() < 4 + total {
            return Ok(None);
        }

        buf.advance(4);
        let kind = FrameKind::try_from(buf[0])?;
        buf.advance(1);
        let payload = buf.split_to(total - 1).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

/// The hello frame both sides send immediately after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub peer_id: String,
    pub listen_port: u16,
}

impl Hello {
    pub fn new(peer_id: &super::PeerId, listen_port: u16) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: "hello".to_string(),
            peer_id: peer_id.to_hex(),
            listen_port,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let json = serde_json::to_vec(self).expect("hello serializes");
        Frame::control(Bytes::from(json))
    }
}

/// Builds a keepalive ping carrying a millisecond timestamp.
pub fn ping_frame(ts_ms: u64) -> Frame {
    let json = serde_json::json!({ "type": "ping", "ts": ts_ms });
    Frame::control(Bytes::from(serde_json::to_vec(&json).expect("ping serializes")))
}

/// Builds the pong echo for a received ping.
pub fn pong_frame(ts_ms: u64) -> Frame {
    let json = serde_json::json!({ "type": "pong", "ts": ts_ms });
    Frame::control(Bytes::from(serde_json::to_vec(&json).expect("pong serializes")))
}

/// Wraps an application payload in the typed message envelope.
///
/// Dispatch inspects the top-level `type` of every control frame, so raw
/// user strings ride inside `{"type":"message","data":...}` and come back
/// out byte-identical on the receiving side.
pub fn wrap_message(data: &str) -> Frame {
    let json = serde_json::json!({ "type": "message", "data": data });
    Frame::control(Bytes::from(
        serde_json::to_vec(&json).expect("message serializes"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::control(Bytes::from_static(b"{\"type\":\"ping\"}"));
        let encoded = frame.encode();

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.kind, FrameKind::Control);
        assert_eq!(decoded.payload, frame.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_decode_partial() {
        let frame = Frame::binary(Bytes::from(vec![7u8; 100]));
        let encoded = frame.encode();

        let mut buf = BytesMut::from(&encoded[..50]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[50..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, FrameKind::Binary);
        assert_eq!(decoded.payload.len(), 100);
    }

    #[test]
    fn test_frame_rejects_oversize() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(0x00);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_rejects_zero_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_frame_rejects_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0x7f);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn test_hello_roundtrip() {
        let id = super::super::PeerId::generate();
        let hello = Hello::new(&id, 4242);
        let frame = hello.to_frame();

        let parsed: Hello = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(parsed.kind, "hello");
        assert_eq!(parsed.v, PROTOCOL_VERSION);
        assert_eq!(parsed.peer_id, id.to_hex());
        assert_eq!(parsed.listen_port, 4242);
    }

    #[test]
    fn test_wrap_message_preserves_data() {
        let frame = wrap_message("hello \"world\" with \u{00e9}");
        let value: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"], "hello \"world\" with \u{00e9}");
    }
}
