//! # Backhaul
//!
//! A reverse HTTP(S) tunneling relay. A public **server** accepts browser
//! traffic and forwards each request over a persistent control connection to
//! a registered **agent**, which relays it to a private local origin and
//! streams the response back.
//!
//! ## Features
//!
//! - **Multiplexing**: many concurrent requests share one tunnel, each as an
//!   independent task identified by a 32-bit ID
//! - **Host-based routing**: the left-most DNS label of the `Host` header (or
//!   an alternative header, or the TLS SNI name) selects the agent
//! - **Host rewriting**: the agent can rewrite the `Host:` line of proxied
//!   requests to match the local origin
//! - **Graceful shutdown**: in-flight tasks drain before the process exits
//!
//! ## Architecture
//!
//! ```text
//! [browser] ──TCP/TLS──► [server:acceptor] ──► [agent lookup] ──► [tunnel]
//!                                                                    │
//!                                                                    ▼
//!                                                  framed over one TCP/TLS stream
//!                                                                    ▲
//!                                                                    │
//!                               [agent:read-loop] ──► [task:dial local origin]
//! ```

pub mod agent;
pub mod config;
pub mod server;
pub mod tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installs the process-wide rustls crypto provider on first call; a no-op afterwards.
///
/// Needed because this crate pins `reqwest` to a "no default provider" TLS feature set
/// (to avoid pulling in both `ring` and `aws-lc-rs` at once), so nothing installs the
/// provider automatically.
pub(crate) fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// First two bytes of an agent handshake, distinguishing it from HTTP/TLS
pub const HANDSHAKE_MAGIC: [u8; 2] = [0xF0, 0x01];

/// Minimum length of an agent id or secret
pub const MIN_ID_SIZE: usize = 1;

/// Maximum length of an agent id or secret
pub const MAX_ID_SIZE: usize = 200;

/// Hard cap on bytes scanned while looking for the MUX header
pub const MAX_HTTP_HEADER_SIZE: usize = 2 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("invalid id and secret")]
    AuthInvalid,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout exceeded")]
    TimeoutExceeded,

    #[error("failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("id not found")]
    IdNotFound,

    #[error("host is too long")]
    HostTooLong,

    #[error("invalid http protocol")]
    InvalidHttp,

    #[error("invalid tls client hello: {0}")]
    InvalidTls(String),

    #[error("connection closed")]
    IoClosed,
}

impl Error {
    /// EOF-like failures tear down their scope but are not worth an error log.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::IoClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            Error::Tunnel(e) => e.is_closed(),
            _ => false,
        }
    }
}
