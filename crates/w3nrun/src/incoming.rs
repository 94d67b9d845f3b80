//! # Incoming Connections
//!
//! The service side of a link. Calls the client makes on the root service
//! (starts without a path) arrive here as `IncomingMsg`s.
//!
//! A service either watches the raw message stream and answers with
//! `send`, or hands a `Router` to `serve`, which does both.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use w3nrpc::CallStatus;
use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;
use w3nrpc::FailureReason;
use w3nrpc::RpcException;

use crate::call::Outcome;
use crate::capability::Envelope;
use crate::capability::Responder;
use crate::capability::ServedCall;
use crate::capability::isolate;
use crate::connection::Connection;
use crate::connection::RootSlot;
use crate::router::Router;

/// One call the client made on the root service.
#[derive(Debug)]
pub struct IncomingCall {
    pub call_num: u64,
    pub method: String,
    pub data: Option<Envelope>,
    pub responder: Responder,
}

impl IncomingCall {
    pub fn into_served(self) -> ServedCall {
        ServedCall { method: self.method, args: self.data, responder: self.responder }
    }
}

#[derive(Debug)]
pub enum IncomingMsg {
    Start(IncomingCall),
    /// The client lost interest in `call_num`.
    Cancel { call_num: u64 },
}

/// An outcome the service sends for one of the client's calls.
#[derive(Debug)]
pub struct OutgoingMsg {
    pub call_num: u64,
    pub status: CallStatus,
    pub data: Option<Envelope>,
    pub err: Option<FailureReason>,
}

impl OutgoingMsg {
    pub fn interim(call_num: u64, data: Option<Envelope>) -> Self {
        Self { call_num, status: CallStatus::Interim, data, err: None }
    }

    pub fn end(call_num: u64, data: Option<Envelope>) -> Self {
        Self { call_num, status: CallStatus::End, data, err: None }
    }

    pub fn error(call_num: u64, err: FailureReason) -> Self {
        Self { call_num, status: CallStatus::Error, data: None, err: Some(err) }
    }
}

/// The messages of one watched incoming connection.
#[derive(Debug)]
pub struct IncomingStream {
    rx: mpsc::UnboundedReceiver<IncomingMsg>,
}

impl IncomingStream {
    /// `None` once the connection is closed.
    pub async fn next(&mut self) -> Option<IncomingMsg> {
        self.rx.recv().await
    }
}

#[derive(Clone, Debug)]
pub struct IncomingConnection {
    conn: Connection,
}

impl IncomingConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Starts receiving calls. Calls made before this are delivered first.
    ///
    /// A connection can be watched once; a second attempt fails with
    /// `connectionAlreadyWatched`.
    pub fn watch(&self) -> Result<IncomingStream, RpcException> {
        let inner = self.conn.inner();
        let mut root = inner.root();
        match std::mem::replace(&mut *root, RootSlot::Closed) {
            RootSlot::Buffering(pending) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for msg in pending {
                    let _ = tx.send(msg);
                }
                *root = RootSlot::Watched(tx);
                Ok(IncomingStream { rx })
            }
            RootSlot::Watched(tx) => {
                *root = RootSlot::Watched(tx);
                Err(inner.exception(ExceptionKind::ConnectionAlreadyWatched))
            }
            RootSlot::Refused => {
                *root = RootSlot::Refused;
                Err(inner.exception(ExceptionKind::ConnectionNotAccepted))
            }
            RootSlot::Closed => {
                let reason = inner.close_reason().unwrap_or(CloseReason::Local);
                Err(inner.exception(ExceptionKind::ConnectionClosed(reason)))
            }
        }
    }

    /// Sends an outcome for the client's call `msg.call_num`.
    ///
    /// Outcomes for calls that already ended or were cancelled are dropped.
    pub fn send(&self, msg: OutgoingMsg) -> Result<(), RpcException> {
        let inner = self.conn.inner();
        if let Some(reason) = inner.close_reason() {
            return Err(inner.exception(ExceptionKind::ConnectionClosed(reason)));
        }

        let OutgoingMsg { call_num, status, data, err } = msg;
        let outcome = match status {
            CallStatus::Interim => Outcome::Interim(data),
            CallStatus::End => Outcome::End(data),
            CallStatus::Error => Outcome::Error(err.unwrap_or_else(|| {
                FailureReason::Handler("error outcome without a reason".into())
            })),
        };

        match inner.responder_for(call_num) {
            Some(responder) => {
                responder.send(outcome);
            }
            None => tracing::debug!(connection = %self.conn.name(), call_num, "outcome for a call no longer open dropped"),
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Watches the connection and answers every call through `router`.
    pub fn serve(&self, router: Router) -> Result<JoinHandle<()>, RpcException> {
        let mut stream = self.watch()?;
        let router = Arc::new(router);
        let name = self.conn.name().to_string();

        Ok(tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    IncomingMsg::Start(call) => {
                        let router = router.clone();
                        let served = call.into_served();
                        let responder = served.responder.clone();
                        let method = served.method.clone();
                        tokio::spawn(isolate(responder, method, async move {
                            router.dispatch(served).await;
                        }));
                    }
                    IncomingMsg::Cancel { call_num } => {
                        tracing::trace!(connection = %name, call_num, "call cancelled by client");
                    }
                }
            }
            tracing::debug!(connection = %name, "incoming connection finished");
        }))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn service(&self) -> &str {
        &self.conn.config().service
    }

    pub fn caller_app(&self) -> Option<&str> {
        self.conn.config().caller_app.as_deref()
    }

    pub fn caller_component(&self) -> Option<&str> {
        self.conn.config().caller_component.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}
