//! # w3nrpc
//!
//! The wire model of the w3n capability RPC protocol.
//!
//! ## Architecture
//!
//! - **datum**: payloads (`Datum`) and the references to live objects they carry.
//! - **exception**: `RpcException`, the platform's structured refusal.
//! - **frame**: the four frames a link exchanges (`Start`, `Cancel`, `Outcome`, `Close`).
//! - **error**: framing errors and the `FailureReason` an `error` outcome carries.
//!
//! Nothing here owns state. Call tables, registries and proxies live in `w3nrun`.

pub mod datum;
pub mod error;
pub mod exception;
pub mod frame;

pub use datum::Datum;
pub use datum::ObjectKind;
pub use datum::ObjectPath;
pub use datum::ObjectReference;
pub use error::Error;
pub use error::FailureReason;
pub use error::Result;
pub use exception::CloseReason;
pub use exception::ExceptionKind;
pub use exception::RpcException;
pub use frame::CallCancel;
pub use frame::CallOutcome;
pub use frame::CallStart;
pub use frame::CallStatus;
pub use frame::Frame;
pub use frame::FrameHeader;
pub use frame::peek_header;

#[cfg(test)]
mod tests;
