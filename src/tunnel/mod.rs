//! Tunnel layer - the framed control connection between agent and server
//!
//! Provides:
//! - Frame encoding and header classification
//! - A buffered peek reader shared by sniffing and the read-loops
//! - The connection wrapper with a serialized write path

mod conn;
mod frame;
mod reader;

pub use conn::Tunnel;
pub use frame::{
    encode_data_header, encode_handshake, error_frame, task_close_frame, ErrorCode,
    FrameHeader, CLOSE_SIGNAL, DATA_HEADER_LEN, ERROR_SIGNAL, MAX_DATA_PAYLOAD, OP_CLOSE,
    OP_DATA, PING_SIGNAL, PRESERVED_SIGNAL, READY_SIGNAL,
};
pub use reader::PeekReader;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("tunnel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn is_closed(&self) -> bool {
        match self {
            TunnelError::Closed => true,
            TunnelError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
