//! Frame codecs for the two wire disciplines.
//!
//! Both codecs are stateless and side-effect-free; all buffering and
//! partial-read handling belongs to the session read loop. The streaming
//! decode contract follows one rule: `Ok(None)` means "need more bytes,
//! buffer untouched beyond what was consumed", and bytes are only consumed
//! once a complete frame (or a discardable blank line) is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{BINARY_HEADER_LEN, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::protocol::message::{AgentMessage, ServerMessage};

// =============================================================================
// Text Framing
// =============================================================================

/// Newline-delimited JSON codec.
pub struct TextCodec;

impl TextCodec {
    /// Serialize a message to JSON and append the `\n` delimiter.
    pub fn encode(msg: &ServerMessage) -> Result<Bytes> {
        let mut out = serde_json::to_vec(msg)
            .map_err(|e| Error::protocol(format!("serialization failed: {e}")))?;
        out.push(b'\n');
        Ok(Bytes::from(out))
    }

    /// Drain the next complete message from an accumulation buffer.
    ///
    /// Returns:
    /// - `Ok(Some(msg))` when a full line decoded (line consumed)
    /// - `Ok(None)` when no complete line is buffered yet; content after the
    ///   last `\n` stays put for the next read
    /// - `Err` when a complete line was malformed; the offending line is
    ///   consumed, so the caller may log and keep draining
    ///
    /// Blank and whitespace-only lines are consumed and skipped silently.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<AgentMessage>> {
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let line = std::str::from_utf8(&line[..pos])
                .map_err(|e| Error::framing(format!("text frame is not UTF-8: {e}")))?
                .trim();

            if line.is_empty() {
                continue;
            }

            return AgentMessage::decode(line).map(Some);
        }

        Ok(None)
    }
}

// =============================================================================
// Binary Framing
// =============================================================================

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    /// Raw type code (see [`crate::protocol::BinaryType`]).
    pub kind: i32,
    pub payload: Bytes,
}

/// Length-prefixed binary codec: `[i32 type LE][i32 length LE]` + payload.
pub struct BinaryCodec;

impl BinaryCodec {
    /// Encode a frame with the fixed 8-byte header.
    pub fn encode(kind: i32, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::framing(format!(
                "payload of {} bytes exceeds maximum {}",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(BINARY_HEADER_LEN + payload.len());
        buf.put_i32_le(kind);
        buf.put_i32_le(payload.len() as i32);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Validate and split an 8-byte header into `(type, length)`.
    ///
    /// A negative or oversized length is a framing error; the connection must
    /// be closed without reading the payload, since this framing has no
    /// recovery point.
    pub fn decode_header(header: [u8; BINARY_HEADER_LEN]) -> Result<(i32, usize)> {
        let kind = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if len < 0 {
            return Err(Error::framing(format!("negative frame length {len}")));
        }
        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::framing(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        Ok((kind, len))
    }

    /// Streaming decode from an accumulation buffer.
    ///
    /// `Ok(None)` when fewer than header + payload bytes are available;
    /// the buffer is only consumed on a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<BinaryFrame>> {
        if buf.len() < BINARY_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; BINARY_HEADER_LEN];
        header.copy_from_slice(&buf[..BINARY_HEADER_LEN]);
        let (kind, len) = Self::decode_header(header)?;

        if buf.len() < BINARY_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(BINARY_HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(BinaryFrame { kind, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{CommandPayload, HeartbeatPayload};

    fn feed(buf: &mut BytesMut, bytes: &[u8]) {
        buf.extend_from_slice(bytes);
    }

    #[test]
    fn text_encode_appends_newline() {
        let msg = ServerMessage::Command(CommandPayload {
            command: "ls".into(),
            command_id: None,
        });
        let bytes = TextCodec::encode(&msg).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn text_decode_waits_for_newline() {
        let mut buf = BytesMut::new();
        feed(&mut buf, br#"{"Type":"he"#);
        assert!(TextCodec::decode(&mut buf).unwrap().is_none());

        // Second read completes the frame split across packet boundaries.
        feed(&mut buf, b"artbeat\"}\n");
        let msg = TextCodec::decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, AgentMessage::Heartbeat(_)));
        assert!(TextCodec::decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn text_decode_multiple_lines_one_at_a_time() {
        let mut buf = BytesMut::new();
        feed(
            &mut buf,
            b"{\"Type\":\"heartbeat\"}\n{\"Type\":\"error\",\"ErrorMessage\":\"x\"}\n",
        );
        assert!(matches!(
            TextCodec::decode(&mut buf).unwrap(),
            Some(AgentMessage::Heartbeat(_))
        ));
        assert!(matches!(
            TextCodec::decode(&mut buf).unwrap(),
            Some(AgentMessage::Error(_))
        ));
        assert!(TextCodec::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn text_decode_skips_blank_lines() {
        let mut buf = BytesMut::new();
        feed(&mut buf, b"\n   \n{\"Type\":\"heartbeat\"}\n");
        assert!(matches!(
            TextCodec::decode(&mut buf).unwrap(),
            Some(AgentMessage::Heartbeat(_))
        ));
    }

    #[test]
    fn text_decode_keeps_trailing_partial_line() {
        let mut buf = BytesMut::new();
        feed(&mut buf, b"{\"Type\":\"heartbeat\"}\n{\"Type\":\"sys");
        assert!(TextCodec::decode(&mut buf).unwrap().is_some());
        assert!(TextCodec::decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"Type\":\"sys");
    }

    #[test]
    fn text_decode_malformed_line_is_consumed() {
        let mut buf = BytesMut::new();
        feed(&mut buf, b"garbage\n{\"Type\":\"heartbeat\"}\n");
        assert!(TextCodec::decode(&mut buf).is_err());
        // The bad line is gone; draining continues with the next frame.
        assert!(matches!(
            TextCodec::decode(&mut buf).unwrap(),
            Some(AgentMessage::Heartbeat(_))
        ));
    }

    #[test]
    fn text_roundtrip_heartbeat() {
        let msg = ServerMessage::Heartbeat(HeartbeatPayload {
            timestamp: "2024-05-01T12:00:00Z".into(),
            sequence: Some("3".into()),
        });
        let bytes = TextCodec::encode(&msg).unwrap();
        let parsed: ServerMessage =
            serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn binary_encode_header_layout() {
        let frame = BinaryCodec::encode(1, b"abc").unwrap();
        assert_eq!(&frame[..4], &1i32.to_le_bytes());
        assert_eq!(&frame[4..8], &3i32.to_le_bytes());
        assert_eq!(&frame[8..], b"abc");
    }

    #[test]
    fn binary_decode_header_rejects_negative_length() {
        let mut header = [0u8; BINARY_HEADER_LEN];
        header[..4].copy_from_slice(&1i32.to_le_bytes());
        header[4..].copy_from_slice(&(-1i32).to_le_bytes());
        let err = BinaryCodec::decode_header(header).unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn binary_decode_header_rejects_oversized_length() {
        let mut header = [0u8; BINARY_HEADER_LEN];
        header[..4].copy_from_slice(&1i32.to_le_bytes());
        header[4..].copy_from_slice(&11_000_000i32.to_le_bytes());
        let err = BinaryCodec::decode_header(header).unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[test]
    fn binary_decode_streaming() {
        let frame = BinaryCodec::encode(2, b"hello").unwrap();
        let mut buf = BytesMut::new();

        // Header alone is not enough.
        feed(&mut buf, &frame[..BINARY_HEADER_LEN]);
        assert!(BinaryCodec::decode(&mut buf).unwrap().is_none());

        feed(&mut buf, &frame[BINARY_HEADER_LEN..]);
        let decoded = BinaryCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, 2);
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn binary_decode_empty_payload() {
        let frame = BinaryCodec::encode(0, b"").unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = BinaryCodec::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.kind, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn binary_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(BinaryCodec::encode(1, &payload).is_err());
    }
}
