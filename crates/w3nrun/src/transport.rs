//! # Transport Abstraction
//!
//! An ordered, reliable, message-oriented duplex link between two sides.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: a transport knows nothing about frames, calls or
//!   objects. It moves opaque buffers, one message per `send`.
//! - **Ordered**: messages arrive in the order they were sent.
//! - **End of Stream**: `recv` returning `Ok(None)` means the other side is
//!   gone. Whether that was orderly is decided by the frames, not here.

use std::fmt;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the link was dropped.
    ConnectionLost(String),
    /// This side already closed the link.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Transport already closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A duplex message link.
///
/// Object-safe, so connections hold it as `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message. `Ok(None)` once the peer is gone.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending. The peer's `recv` sees end of stream.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
