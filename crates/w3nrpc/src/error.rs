//! # Error Definitions
//!
//! Two families live here. `Error` means the *bytes* were wrong: a frame that
//! cannot be encoded or decoded. `FailureReason` is the *content* of an error
//! outcome: the remote side (or the local runtime acting for it) reporting
//! that a call failed.

use w3npack::Error as PackError;

use crate::exception::RpcException;

/// Framing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying w3npack encoding failed.
    Serialization(PackError),
    /// A required field was absent.
    MissingField(&'static str),
    /// A tag string did not name a known frame, status or failure.
    UnknownVariant(String),
    /// An object reference named a kind this peer does not implement.
    UnsupportedKind(String),
    /// Fields were present but inconsistent with each other.
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization failed: {}", e),
            Self::MissingField(name) => write!(f, "missing field '{}'", name),
            Self::UnknownVariant(tag) => write!(f, "unknown variant '{}'", tag),
            Self::UnsupportedKind(kind) => write!(f, "unsupported capability kind '{}'", kind),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a call ended in `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A structured platform exception (lookup, authorization, closed link, ...).
    Rpc(RpcException),
    /// The handler on the other side failed with an application message.
    Handler(String),
    /// Nothing on the other side answers to this method name.
    MethodNotFound(String),
    /// A frame for this call could not be understood.
    ProtocolViolation(String),
}

impl FailureReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Rpc(_) => "Rpc",
            Self::Handler(_) => "Handler",
            Self::MethodNotFound(_) => "NoMethod",
            Self::ProtocolViolation(_) => "Protocol",
        }
    }

    /// Returns the exception if this failure is a platform exception.
    pub fn as_rpc(&self) -> Option<&RpcException> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{}", e),
            Self::Handler(msg) => write!(f, "handler failed: {}", msg),
            Self::MethodNotFound(method) => write!(f, "method '{}' not found", method),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for FailureReason {}

impl From<RpcException> for FailureReason {
    fn from(e: RpcException) -> Self { Self::Rpc(e) }
}
