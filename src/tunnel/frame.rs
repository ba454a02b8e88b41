//! Frame encoding for the tunnel protocol
//!
//! Every frame starts with a 32-bit big-endian header word. Values at the top
//! of the u32 space are connection-level signals; anything below the reserved
//! range is a task ID followed by a 16-bit opcode:
//!
//! ```text
//! +----------------+--------+-----------------+-----------+
//! | task id (4B BE)| op (2B)| if DATA: len 4B | payload   |
//! +----------------+--------+-----------------+-----------+
//! ```
//!
//! Signals carry no opcode; ERROR is followed by a 16-bit error code.

use super::TunnelError;
use bytes::{BufMut, BytesMut};

/// Keepalive probe, no payload
pub const PING_SIGNAL: u32 = u32::MAX;

/// Connection-level close, no payload
pub const CLOSE_SIGNAL: u32 = u32::MAX - 1;

/// Tunnel accepted and ready for tasks (server to agent only)
pub const READY_SIGNAL: u32 = u32::MAX - 2;

/// Fatal error, followed by a 16-bit code
pub const ERROR_SIGNAL: u32 = u32::MAX - 3;

/// Lower bound of the reserved signal range; task IDs live in
/// `[1, PRESERVED_SIGNAL)` and the seed wraps back to 1 on reaching it.
pub const PRESERVED_SIGNAL: u32 = u32::MAX - 3000;

/// Task-scoped data opcode
pub const OP_DATA: u16 = 0x0000;

/// Task-scoped close opcode
pub const OP_CLOSE: u16 = 0x0001;

/// Fixed DATA frame header size: id + opcode + length
pub const DATA_HEADER_LEN: usize = 10;

/// Senders split larger reads across frames so one DATA frame never exceeds
/// this payload size.
pub const MAX_DATA_PAYLOAD: usize = 4 * 1024;

/// 16-bit error codes carried after [`ERROR_SIGNAL`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidIdAndSecret = 0x0001,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(ErrorCode::InvalidIdAndSecret),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidIdAndSecret => write!(f, "invalid id and secret"),
        }
    }
}

/// Classification of the leading 32-bit header word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Ping,
    Close,
    Ready,
    Error,
    Task(u32),
}

impl FrameHeader {
    /// Classify a header word. Reserved values other than the four known
    /// signals are invalid on the wire.
    pub fn classify(word: u32) -> Result<Self, TunnelError> {
        match word {
            PING_SIGNAL => Ok(FrameHeader::Ping),
            CLOSE_SIGNAL => Ok(FrameHeader::Close),
            READY_SIGNAL => Ok(FrameHeader::Ready),
            ERROR_SIGNAL => Ok(FrameHeader::Error),
            id if id >= PRESERVED_SIGNAL => Err(TunnelError::InvalidFrame(format!(
                "reserved header word {id:#010x}"
            ))),
            0 => Err(TunnelError::InvalidFrame("task id 0".to_string())),
            id => Ok(FrameHeader::Task(id)),
        }
    }
}

/// Write the 10-byte DATA frame header into the front of `buf`.
///
/// `buf` must be at least [`DATA_HEADER_LEN`] long; the payload follows it in
/// the same buffer so the whole frame goes out in a single write.
pub fn encode_data_header(buf: &mut [u8], id: u32, len: u32) {
    buf[0..4].copy_from_slice(&id.to_be_bytes());
    buf[4..6].copy_from_slice(&OP_DATA.to_be_bytes());
    buf[6..10].copy_from_slice(&len.to_be_bytes());
}

/// Encode a task-scoped CLOSE frame.
pub fn task_close_frame(id: u32) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..4].copy_from_slice(&id.to_be_bytes());
    buf[4..6].copy_from_slice(&OP_CLOSE.to_be_bytes());
    buf
}

/// Encode the ERROR signal with its 16-bit code.
pub fn error_frame(code: ErrorCode) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..4].copy_from_slice(&ERROR_SIGNAL.to_be_bytes());
    buf[4..6].copy_from_slice(&(code as u16).to_be_bytes());
    buf
}

/// Encode the agent handshake: magic, id, secret, reserved option byte.
///
/// Lengths are validated against the 1..=200 bounds before encoding.
pub fn encode_handshake(id: &str, secret: &str) -> Result<BytesMut, TunnelError> {
    if id.is_empty() || id.len() > crate::MAX_ID_SIZE {
        return Err(TunnelError::InvalidFrame(format!(
            "id length {} out of bounds",
            id.len()
        )));
    }
    if secret.is_empty() || secret.len() > crate::MAX_ID_SIZE {
        return Err(TunnelError::InvalidFrame(format!(
            "secret length {} out of bounds",
            secret.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(5 + id.len() + secret.len());
    buf.put_slice(&crate::HANDSHAKE_MAGIC);
    buf.put_u8(id.len() as u8);
    buf.put_slice(id.as_bytes());
    buf.put_u8(secret.len() as u8);
    buf.put_slice(secret.as_bytes());
    buf.put_u8(0x00); // reserved option
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_signals() {
        assert_eq!(FrameHeader::classify(0xFFFF_FFFF).unwrap(), FrameHeader::Ping);
        assert_eq!(FrameHeader::classify(0xFFFF_FFFE).unwrap(), FrameHeader::Close);
        assert_eq!(FrameHeader::classify(0xFFFF_FFFD).unwrap(), FrameHeader::Ready);
        assert_eq!(FrameHeader::classify(0xFFFF_FFFC).unwrap(), FrameHeader::Error);
        assert_eq!(FrameHeader::classify(1).unwrap(), FrameHeader::Task(1));
        assert_eq!(
            FrameHeader::classify(PRESERVED_SIGNAL - 1).unwrap(),
            FrameHeader::Task(PRESERVED_SIGNAL - 1)
        );
    }

    #[test]
    fn test_classify_reserved_range_is_invalid() {
        assert!(FrameHeader::classify(PRESERVED_SIGNAL).is_err());
        assert!(FrameHeader::classify(u32::MAX - 4).is_err());
        assert!(FrameHeader::classify(0).is_err());
    }

    #[test]
    fn test_data_header_layout() {
        let mut buf = [0u8; DATA_HEADER_LEN];
        encode_data_header(&mut buf, 0x0102_0304, 0x0000_1000);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00]);
    }

    #[test]
    fn test_task_close_layout() {
        assert_eq!(task_close_frame(7), [0x00, 0x00, 0x00, 0x07, 0x00, 0x01]);
    }

    #[test]
    fn test_error_frame_layout() {
        // The exact bytes an agent sees on auth failure.
        assert_eq!(
            error_frame(ErrorCode::InvalidIdAndSecret),
            [0xFF, 0xFF, 0xFF, 0xFC, 0x00, 0x01]
        );
    }

    #[test]
    fn test_handshake_layout() {
        let buf = encode_handshake("abc", "s3cret").unwrap();
        let mut expect = vec![0xF0, 0x01, 3];
        expect.extend_from_slice(b"abc");
        expect.push(6);
        expect.extend_from_slice(b"s3cret");
        expect.push(0);
        assert_eq!(&buf[..], &expect[..]);
    }

    #[test]
    fn test_handshake_rejects_bad_lengths() {
        assert!(encode_handshake("", "x").is_err());
        let long = "a".repeat(201);
        assert!(encode_handshake(&long, "x").is_err());
        assert!(encode_handshake("x", &long).is_err());
    }
}
