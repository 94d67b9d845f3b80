use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;
use w3nrpc::RpcException;

use crate::transport;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The call failed on the other side, or the link failed under it.
    Remote(FailureReason),
    /// The platform refused a connect or an expose.
    Rpc(RpcException),
    Transport(transport::Error),
    /// A payload did not decode.
    Pack(w3npack::Error),
    /// A payload decoded but did not make sense.
    Protocol(w3nrpc::Error),
    /// A reply lacked something the method always returns.
    MissingReply(&'static str),
    /// A typed view was given an object of another kind.
    WrongKind { expected: ObjectKind, found: ObjectKind },
    UnknownApp(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(reason) => write!(f, "Call failed: {}", reason),
            Self::Rpc(exc) => write!(f, "{}", exc),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Pack(e) => write!(f, "Payload error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::MissingReply(what) => write!(f, "Reply is missing {}", what),
            Self::WrongKind { expected, found } => write!(f, "Expected a {} object, got {}", expected, found),
            Self::UnknownApp(domain) => write!(f, "No app installed with domain '{}'", domain),
        }
    }
}

impl std::error::Error for Error {}

impl From<FailureReason> for Error {
    fn from(e: FailureReason) -> Self {
        Self::Remote(e)
    }
}

impl From<RpcException> for Error {
    fn from(e: RpcException) -> Self {
        Self::Rpc(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<w3npack::Error> for Error {
    fn from(e: w3npack::Error) -> Self {
        Self::Pack(e)
    }
}

impl From<w3nrpc::Error> for Error {
    fn from(e: w3nrpc::Error) -> Self {
        Self::Protocol(e)
    }
}

impl Error {
    /// The platform exception behind this error, if there is one.
    pub fn as_rpc(&self) -> Option<&RpcException> {
        match self {
            Self::Rpc(exc) => Some(exc),
            Self::Remote(reason) => reason.as_rpc(),
            _ => None,
        }
    }

    /// Collapses the error into what an `error` outcome can carry.
    pub fn into_failure(self) -> FailureReason {
        match self {
            Self::Remote(reason) => reason,
            Self::Rpc(exc) => FailureReason::Rpc(exc),
            other => FailureReason::Handler(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
