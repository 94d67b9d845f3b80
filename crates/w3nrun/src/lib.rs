//! # w3nrun
//!
//! Runtime for w3n capability RPC: links between apps, the calls multiplexed
//! over them, and the live objects those calls carry.
//!
//! ## Architecture
//!
//! - **transport**/**channel**: moving opaque frames. `channel::link`
//!   links two connections inside one process.
//! - **connection**: one end of a link. Owns the call table, the object
//!   registry and the pump tasks.
//! - **call**: the per-call state machine and the caller's view of a call.
//! - **capability**/**marshal**/**proxy**/**registry**: objects, how they cross
//!   a link, and what stands in for them on the other side.
//! - **incoming**/**router**: the service end of a link.
//! - **service**: the `Platform` that apps expose services on and connect
//!   through.
//! - **valve**/**bridge**: flow control for streaming into a byte sink.
//! - **caps**: typed views and in-memory implementations of the object kinds.

pub mod bridge;
pub mod call;
pub mod capability;
pub mod caps;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod incoming;
mod marshal;
pub mod proxy;
mod registry;
pub mod router;
pub mod service;
pub mod transport;
pub mod valve;

pub use call::CallEvent;
pub use call::CallResult;
pub use call::CancelHandle;
pub use call::ObservableCall;
pub use capability::Cap;
pub use capability::CapObject;
pub use capability::Envelope;
pub use capability::Responder;
pub use capability::ServedCall;
pub use config::AppManifest;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::Error;
pub use error::Result;
pub use incoming::IncomingConnection;
pub use incoming::IncomingMsg;
pub use incoming::OutgoingMsg;
pub use router::Router;
pub use service::Platform;
pub use service::ServiceListener;
pub use service::ServiceRegistry;
pub use valve::Valve;
