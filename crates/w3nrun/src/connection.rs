//! # Connection
//!
//! One side of a link. Multiplexes any number of concurrent calls in both
//! directions over a single transport.
//!
//! ## Architecture
//!
//! Two background tasks per connection:
//!
//! - **reader**: decodes each message and routes it. Outcomes go to the call
//!   table, starts are served (root service or an exported object), cancels
//!   reach the served call, `Close` ends the link.
//! - **writer**: drains the outbox in order. Everything this side sends goes
//!   through it, so frames leave in the order they were produced.
//!
//! ## Invariants
//! - Call numbers start at 1 and increase; one is never reused.
//! - Closing, for any reason, settles every open call exactly once with
//!   `connectionClosed` and drops the object registry.
//! - A message that cannot be decoded fails the call it names, if any, and
//!   never takes the connection down.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use w3nrpc::CallCancel;
use w3nrpc::CallOutcome;
use w3nrpc::CallStart;
use w3nrpc::CallStatus;
use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;
use w3nrpc::FailureReason;
use w3nrpc::Frame;
use w3nrpc::FrameHeader;
use w3nrpc::ObjectPath;
use w3nrpc::RpcException;
use w3nrpc::peek_header;

use crate::call::Call;
use crate::call::CallResult;
use crate::call::CallSink;
use crate::call::CancelHandle;
use crate::call::ObservableCall;
use crate::call::Outcome;
use crate::capability::Envelope;
use crate::capability::Responder;
use crate::capability::ServedCall;
use crate::capability::dispatch_isolated;
use crate::config::ConnectionConfig;
use crate::incoming::IncomingCall;
use crate::incoming::IncomingMsg;
use crate::marshal;
use crate::registry::ObjectRegistry;
use crate::transport::Transport;

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// Which end of a link a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opened the link by connecting to a service.
    Client,
    /// Accepted the link on behalf of an exposed service.
    Service,
}

impl Side {
    /// First segment of every path this side exports.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            Self::Client => "c",
            Self::Service => "s",
        }
    }
}

enum Outbound {
    Frame(Frame),
    /// Send `Close`, then close the transport.
    Close(oneshot::Sender<()>),
    /// Close the transport without a frame.
    Shutdown,
}

/// Where starts without a path go.
pub(crate) enum RootSlot {
    /// Client side: there is no root service to call.
    Refused,
    /// Service side before `watch`: held until someone watches.
    Buffering(Vec<IncomingMsg>),
    Watched(mpsc::UnboundedSender<IncomingMsg>),
    Closed,
}

struct ServedEntry {
    cancel: watch::Sender<bool>,
    responder: Responder,
    root: bool,
}

pub(crate) struct ConnInner {
    link: u64,
    side: Side,
    config: ConnectionConfig,
    outbox: mpsc::UnboundedSender<Outbound>,
    calls: DashMap<u64, Call>,
    next_call: AtomicU64,
    served: DashMap<u64, ServedEntry>,
    pub(crate) registry: ObjectRegistry,
    root: Mutex<RootSlot>,
    closed: watch::Sender<Option<CloseReason>>,
}

/// A handle to one side of a link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Wraps `transport` and spawns the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: ConnectionConfig, side: Side, transport: Box<dyn Transport>) -> Self {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);

        let root = match side {
            Side::Client => RootSlot::Refused,
            Side::Service => RootSlot::Buffering(Vec::new()),
        };

        let inner = Arc::new(ConnInner {
            link: NEXT_LINK.fetch_add(1, Ordering::Relaxed),
            side,
            config,
            outbox,
            calls: DashMap::new(),
            next_call: AtomicU64::new(1),
            served: DashMap::new(),
            registry: ObjectRegistry::new(side.path_prefix()),
            root: Mutex::new(root),
            closed,
        });

        tracing::debug!(connection = %inner.config.name, link = inner.link, ?side, "connection opened");

        tokio::spawn(write_loop(Arc::downgrade(&inner), transport.clone(), outbox_rx));
        tokio::spawn(read_loop(inner.clone(), transport));

        Self { inner }
    }

    /// Calls a method of the peer's root service and waits for `end` or `error`.
    pub async fn call(&self, method: &str, args: Option<Envelope>) -> CallResult {
        self.inner.call_at(None, method, args).await
    }

    /// Calls a method of the peer's root service and streams every outcome.
    pub fn observe(&self, method: &str, args: Option<Envelope>) -> ObservableCall {
        self.inner.observe_at(None, method, args)
    }

    /// Closes the link. Idempotent.
    ///
    /// Open calls fail with `connectionClosed`; the peer is told with a
    /// `Close` frame.
    pub async fn close(&self) {
        self.inner.close_local().await;
    }

    /// Resolves once the connection is closed, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.closed.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => (*reason).unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Local,
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Calls of this side still waiting for a terminal outcome.
    pub fn open_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Objects this side currently exports on this link.
    pub fn exported_objects(&self) -> usize {
        self.inner.registry.export_count()
    }

    /// Proxies this side currently holds on this link.
    pub fn imported_objects(&self) -> usize {
        self.inner.registry.import_count()
    }

    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.config.name)
            .field("link", &self.inner.link)
            .field("side", &self.inner.side)
            .field("closed", &self.inner.close_reason())
            .finish()
    }
}

impl ConnInner {
    pub(crate) fn link(&self) -> u64 {
        self.link
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        *self.closed.borrow()
    }

    pub(crate) fn exception(&self, kind: ExceptionKind) -> RpcException {
        RpcException::new(&self.config.app_domain, &self.config.service, kind)
            .with_caller(self.config.caller_app.clone(), self.config.caller_component.clone())
    }

    fn closed_failure(&self, reason: CloseReason, method: &str) -> FailureReason {
        FailureReason::Rpc(self.exception(ExceptionKind::ConnectionClosed(reason)).with_method(method))
    }

    pub(crate) fn root(&self) -> MutexGuard<'_, RootSlot> {
        self.root.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) async fn call_at(self: &Arc<Self>, path: Option<ObjectPath>, method: &str, args: Option<Envelope>) -> CallResult {
        let (tx, rx) = oneshot::channel();
        self.start_call(path, method, args, CallSink::Reply(tx));
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                let reason = self.close_reason().unwrap_or(CloseReason::TransportFailure);
                Err(self.closed_failure(reason, method))
            }
        }
    }

    pub(crate) fn observe_at(self: &Arc<Self>, path: Option<ObjectPath>, method: &str, args: Option<Envelope>) -> ObservableCall {
        let (tx, rx) = mpsc::unbounded_channel();
        let call_num = self.start_call(path, method, args, CallSink::Observe(tx));

        let conn = Arc::downgrade(self);
        let cancel = CancelHandle::new(move || {
            if let Some(conn) = conn.upgrade() {
                conn.cancel_call(call_num);
            }
        });
        ObservableCall::new(rx, cancel)
    }

    fn start_call(self: &Arc<Self>, path: Option<ObjectPath>, method: &str, args: Option<Envelope>, sink: CallSink) -> u64 {
        let call_num = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.calls.insert(call_num, Call::new(method, sink));

        let data = match self.close_reason() {
            Some(_) => None,
            None => args.map(|a| marshal::pack(self, a)),
        };
        let start = CallStart { call_num, path, method: method.to_string(), data };

        tracing::trace!(connection = %self.config.name, call_num, method, "call started");

        if !self.enqueue(Frame::Start(start)) {
            let reason = self.close_reason().unwrap_or(CloseReason::TransportFailure);
            if let Some((_, mut call)) = self.calls.remove(&call_num) {
                call.deliver(Outcome::Error(self.closed_failure(reason, method)));
            }
        }
        call_num
    }

    fn cancel_call(&self, call_num: u64) {
        let Some((_, mut call)) = self.calls.remove(&call_num) else {
            return;
        };
        if call.cancel() {
            tracing::trace!(connection = %self.config.name, call_num, "call cancelled");
            self.enqueue(Frame::Cancel(CallCancel { call_num }));
        }
    }

    fn enqueue(&self, frame: Frame) -> bool {
        if self.close_reason().is_some() {
            return false;
        }
        self.outbox.send(Outbound::Frame(frame)).is_ok()
    }

    /// Sends an outcome for a call the peer made.
    pub(crate) fn send_outcome(&self, call_num: u64, outcome: Outcome) -> bool {
        if outcome.is_terminal() {
            self.served.remove(&call_num);
        }
        if self.close_reason().is_some() {
            return false;
        }

        let outcome = match outcome {
            Outcome::Interim(data) => CallOutcome::interim(call_num, data.map(|d| marshal::pack(self, d))),
            Outcome::End(data) => CallOutcome::end(call_num, data.map(|d| marshal::pack(self, d))),
            Outcome::Error(reason) => CallOutcome::error(call_num, reason),
        };
        self.enqueue(Frame::Outcome(outcome))
    }

    /// Settles a served call from outside the object serving it.
    pub(crate) fn responder_for(&self, call_num: u64) -> Option<Responder> {
        self.served.get(&call_num).map(|e| e.responder.clone())
    }

    /// Returns `false` once the peer closed the link.
    fn handle_message(self: &Arc<Self>, bytes: &[u8]) -> bool {
        match Frame::from_bytes(bytes) {
            Ok(Frame::Start(start)) => self.on_start(start),
            Ok(Frame::Cancel(cancel)) => self.on_cancel(cancel.call_num),
            Ok(Frame::Outcome(outcome)) => self.on_outcome(outcome),
            Ok(Frame::Close) => return false,
            Err(err) => self.on_undecodable(bytes, err),
        }
        true
    }

    fn on_start(self: &Arc<Self>, start: CallStart) {
        let CallStart { call_num, path, method, data } = start;

        let args = match data.map(|d| marshal::unpack(self, d)).transpose() {
            Ok(args) => args,
            Err(kind) => {
                tracing::debug!(connection = %self.config.name, call_num, %method, "rejecting call with bad arguments");
                let exc = self.exception(kind).with_method(&method);
                self.send_outcome(call_num, Outcome::Error(FailureReason::Rpc(exc)));
                return;
            }
        };

        let object = match &path {
            Some(path) => match self.registry.exported(path) {
                Some(object) => Some(object),
                None => {
                    tracing::debug!(connection = %self.config.name, call_num, ?path, "call to unknown object");
                    let exc = self.exception(ExceptionKind::UnknownReference).with_method(&method);
                    self.send_outcome(call_num, Outcome::Error(FailureReason::Rpc(exc)));
                    return;
                }
            },
            None => None,
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let responder = Responder::link(Arc::downgrade(self), call_num, cancel_rx);
        self.served.insert(call_num, ServedEntry {
            cancel,
            responder: responder.clone(),
            root: object.is_none(),
        });

        match object {
            Some(object) => {
                let conn = self.clone();
                let call = ServedCall { method, args, responder };
                tokio::spawn(async move {
                    dispatch_isolated(object, call).await;
                    conn.served.remove(&call_num);
                });
            }
            None => {
                let call = IncomingCall { call_num, method, data: args, responder };
                self.deliver_root(IncomingMsg::Start(call));
            }
        }
    }

    fn deliver_root(&self, msg: IncomingMsg) {
        let refused = {
            let mut root = self.root();
            match &mut *root {
                RootSlot::Buffering(pending) => {
                    pending.push(msg);
                    None
                }
                RootSlot::Watched(tx) => match tx.send(msg) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(msg)) => {
                        *root = RootSlot::Closed;
                        Some(msg)
                    }
                },
                RootSlot::Refused | RootSlot::Closed => Some(msg),
            }
        };

        if let Some(IncomingMsg::Start(call)) = refused {
            let reason = match self.side {
                Side::Client => FailureReason::MethodNotFound(call.method.clone()),
                Side::Service => FailureReason::Rpc(
                    self.exception(ExceptionKind::ConnectionNotAccepted).with_method(&call.method),
                ),
            };
            call.responder.fail(reason);
        }
    }

    fn on_cancel(&self, call_num: u64) {
        let Some((_, entry)) = self.served.remove(&call_num) else {
            tracing::trace!(connection = %self.config.name, call_num, "cancel for a call no longer served");
            return;
        };
        entry.cancel.send_replace(true);
        if entry.root {
            self.deliver_root(IncomingMsg::Cancel { call_num });
        }
    }

    fn on_outcome(self: &Arc<Self>, outcome: CallOutcome) {
        let CallOutcome { call_num, status, data, err } = outcome;

        let Some(method) = self.calls.get(&call_num).map(|c| c.method().to_string()) else {
            tracing::trace!(connection = %self.config.name, call_num, "outcome for unknown or finished call dropped");
            return;
        };

        let unpacked = data.map(|d| marshal::unpack(self, d)).transpose();
        let outcome = match (status, unpacked) {
            (CallStatus::Error, _) => Outcome::Error(err.unwrap_or_else(|| {
                FailureReason::ProtocolViolation("error outcome without a reason".into())
            })),
            (_, Err(kind)) => Outcome::Error(FailureReason::Rpc(self.exception(kind).with_method(&method))),
            (CallStatus::Interim, Ok(data)) => Outcome::Interim(data),
            (CallStatus::End, Ok(data)) => Outcome::End(data),
        };

        if outcome.is_terminal() {
            if let Some((_, mut call)) = self.calls.remove(&call_num) {
                call.deliver(outcome);
            }
        } else if let Some(mut call) = self.calls.get_mut(&call_num) {
            call.deliver(outcome);
        }
    }

    fn on_undecodable(&self, bytes: &[u8], err: w3nrpc::Error) {
        let failure = |method: Option<&str>| match &err {
            w3nrpc::Error::UnsupportedKind(kind) => {
                let mut exc = self.exception(ExceptionKind::UnsupportedKind(kind.clone()));
                exc.method = method.map(str::to_string);
                FailureReason::Rpc(exc)
            }
            other => FailureReason::ProtocolViolation(other.to_string()),
        };

        match peek_header(bytes) {
            Ok(FrameHeader::Start(call_num)) => {
                tracing::warn!(connection = %self.config.name, call_num, error = %err, "rejecting undecodable call");
                self.send_outcome(call_num, Outcome::Error(failure(None)));
            }
            Ok(FrameHeader::Outcome(call_num)) => {
                tracing::warn!(connection = %self.config.name, call_num, error = %err, "undecodable outcome");
                if let Some((_, mut call)) = self.calls.remove(&call_num) {
                    let reason = failure(Some(call.method()));
                    call.deliver(Outcome::Error(reason));
                }
            }
            Ok(header) => {
                tracing::warn!(connection = %self.config.name, ?header, error = %err, "dropping undecodable frame");
            }
            Err(peek_err) => {
                tracing::warn!(connection = %self.config.name, error = %peek_err, "dropping unreadable message");
            }
        }
    }

    /// Tears down local state. Returns `false` if already closed.
    pub(crate) fn shutdown(&self, reason: CloseReason) -> bool {
        let first = self.closed.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        });
        if !first {
            return false;
        }

        let open: Vec<u64> = self.calls.iter().map(|e| *e.key()).collect();
        tracing::debug!(
            connection = %self.config.name,
            reason = reason.as_tag(),
            open_calls = open.len(),
            "connection closed",
        );
        for call_num in open {
            if let Some((_, mut call)) = self.calls.remove(&call_num) {
                let failure = self.closed_failure(reason, call.method());
                call.deliver(Outcome::Error(failure));
            }
        }

        let served: Vec<u64> = self.served.iter().map(|e| *e.key()).collect();
        for call_num in served {
            if let Some((_, entry)) = self.served.remove(&call_num) {
                entry.cancel.send_replace(true);
            }
        }

        *self.root() = RootSlot::Closed;
        self.registry.clear();
        true
    }

    async fn close_local(&self) {
        if !self.shutdown(CloseReason::Local) {
            return;
        }
        let (ack, done) = oneshot::channel();
        if self.outbox.send(Outbound::Close(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_loop(conn: Weak<ConnInner>, transport: Arc<dyn Transport>, mut outbox: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = outbox.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let bytes = match frame.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(error = %e, "dropping frame that failed to encode");
                        continue;
                    }
                };
                if let Err(e) = transport.send(&bytes).await {
                    tracing::warn!(error = %e, "transport send failed");
                    if let Some(conn) = conn.upgrade() {
                        conn.shutdown(CloseReason::TransportFailure);
                    }
                    break;
                }
            }
            Outbound::Close(ack) => {
                match Frame::Close.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = transport.send(&bytes).await {
                            tracing::debug!(error = %e, "close frame not delivered");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "close frame failed to encode"),
                }
                let _ = transport.close().await;
                let _ = ack.send(());
                return;
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = transport.close().await;
}

async fn read_loop(conn: Arc<ConnInner>, transport: Arc<dyn Transport>) {
    let mut closed = conn.closed.subscribe();

    let reason = loop {
        tokio::select! {
            msg = transport.recv() => match msg {
                Ok(Some(bytes)) => {
                    if !conn.handle_message(&bytes) {
                        break CloseReason::Peer;
                    }
                }
                Ok(None) => break CloseReason::TransportFailure,
                Err(e) => {
                    tracing::warn!(connection = %conn.config.name, error = %e, "transport receive failed");
                    break CloseReason::TransportFailure;
                }
            },
            _ = closed.wait_for(Option::is_some) => return,
        }
    };

    if conn.shutdown(reason) {
        let _ = conn.outbox.send(Outbound::Shutdown);
    }
}
