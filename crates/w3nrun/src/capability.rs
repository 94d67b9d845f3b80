//! # Capabilities
//!
//! A capability is a live object that can be handed to the other side of a
//! connection. Locally it is an `Arc<dyn CapObject>`; across a link it
//! travels as an `ObjectReference` and comes out as a proxy that implements
//! the same trait.
//!
//! Every call on a capability, local or proxied, goes through `invoke` with a
//! `Responder` that carries the outcomes back. `call_object` and
//! `observe_object` are the caller's side of that.
//!
//! ## Invariants
//! - A `Responder` delivers at most one terminal outcome. Anything sent after
//!   it is dropped and reported as not delivered.
//! - When `invoke` returns or panics without a terminal outcome, the call is
//!   failed with a handler error, unless the caller cancelled it.

use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::watch;

use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;
use w3nrpc::ObjectReference;

use crate::call::CallEvent;
use crate::call::CallResult;
use crate::call::CancelHandle;
use crate::call::ObservableCall;
use crate::call::Outcome;
use crate::connection::ConnInner;

pub type Cap = Arc<dyn CapObject>;

/// The payload of a call or an outcome.
///
/// `None` fields are absent on the wire; `Some(vec![])` is an empty list.
#[derive(Clone, Default)]
pub struct Envelope {
    pub bytes: Option<Vec<u8>>,
    pub caps: Option<Vec<Cap>>,
}

impl Envelope {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: Some(bytes.into()), caps: None }
    }

    pub fn caps(caps: Vec<Cap>) -> Self {
        Self { bytes: None, caps: Some(caps) }
    }

    pub fn with_caps(mut self, caps: Vec<Cap>) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn bytes_ref(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn cap(&self, index: usize) -> Option<&Cap> {
        self.caps.as_ref().and_then(|caps| caps.get(index))
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Option<Vec<ObjectKind>> = self.caps.as_ref()
            .map(|caps| caps.iter().map(|c| c.kind()).collect());
        f.debug_struct("Envelope")
            .field("bytes", &self.bytes.as_ref().map(Vec::len))
            .field("caps", &kinds)
            .finish()
    }
}

/// Where a proxy points: the link it belongs to and the owner's reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub link: u64,
    pub reference: ObjectReference,
}

/// A live object callable by method name.
#[async_trait::async_trait]
pub trait CapObject: Send + Sync + 'static {
    fn kind(&self) -> ObjectKind;

    /// Serves one call. The call should be settled through
    /// `call.responder` before this returns.
    async fn invoke(&self, call: ServedCall);

    /// Set for proxies only.
    fn remote_ref(&self) -> Option<RemoteRef> {
        None
    }
}

/// A call as seen by the object serving it.
#[derive(Debug)]
pub struct ServedCall {
    pub method: String,
    pub args: Option<Envelope>,
    pub responder: Responder,
}

impl ServedCall {
    pub fn arg_bytes(&self) -> Option<&[u8]> {
        self.args.as_ref().and_then(Envelope::bytes_ref)
    }

    pub fn arg_cap(&self, index: usize) -> Option<&Cap> {
        self.args.as_ref().and_then(|a| a.cap(index))
    }
}

/// Sends the outcomes of one served call.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    done: AtomicBool,
    cancel: watch::Receiver<bool>,
    route: Route,
}

enum Route {
    Link { conn: Weak<ConnInner>, call_num: u64 },
    Local(mpsc::UnboundedSender<Outcome>),
}

impl Responder {
    pub(crate) fn link(conn: Weak<ConnInner>, call_num: u64, cancel: watch::Receiver<bool>) -> Self {
        Self::with_route(Route::Link { conn, call_num }, cancel)
    }

    /// A responder whose outcomes land in a channel, plus the switch that
    /// cancels it.
    pub(crate) fn local() -> (Self, mpsc::UnboundedReceiver<Outcome>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (Self::with_route(Route::Local(tx), cancel_rx), rx, cancel_tx)
    }

    fn with_route(route: Route, cancel: watch::Receiver<bool>) -> Self {
        Self {
            inner: Arc::new(ResponderInner { done: AtomicBool::new(false), cancel, route }),
        }
    }

    /// Returns `false` if the outcome was not delivered.
    pub fn send(&self, outcome: Outcome) -> bool {
        if outcome.is_terminal() {
            if self.inner.done.swap(true, Ordering::SeqCst) {
                return false;
            }
        } else if self.inner.done.load(Ordering::SeqCst) {
            return false;
        }

        match &self.inner.route {
            Route::Local(tx) => tx.send(outcome).is_ok(),
            Route::Link { conn, call_num } => match conn.upgrade() {
                Some(conn) => conn.send_outcome(*call_num, outcome),
                None => false,
            },
        }
    }

    pub fn interim(&self, data: Option<Envelope>) -> bool {
        self.send(Outcome::Interim(data))
    }

    pub fn end(&self, data: Option<Envelope>) -> bool {
        self.send(Outcome::End(data))
    }

    pub fn fail(&self, reason: FailureReason) -> bool {
        self.send(Outcome::Error(reason))
    }

    /// Settles the call from a request-reply result.
    pub fn settle(&self, result: CallResult) -> bool {
        match result {
            Ok(data) => self.end(data),
            Err(reason) => self.fail(reason),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Resolves once the caller cancels. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Runs `invoke` and fails the call if the object left it unsettled.
async fn dispatch(object: &dyn CapObject, call: ServedCall) {
    let responder = call.responder.clone();
    let method = call.method.clone();
    object.invoke(call).await;
    ensure_settled(&responder, &method);
}

/// `dispatch` on a task of its own, so a panicking object fails the call
/// instead of leaving it open.
pub(crate) async fn dispatch_isolated(object: Cap, call: ServedCall) {
    let responder = call.responder.clone();
    let method = call.method.clone();
    isolate(responder, method, async move { dispatch(object.as_ref(), call).await }).await;
}

/// Runs `serve` on its own task and fails the call if that task panics.
pub(crate) async fn isolate(responder: Responder, method: String, serve: impl Future<Output = ()> + Send + 'static) {
    if let Err(e) = tokio::spawn(serve).await {
        tracing::error!(%method, error = %e, "call handler panicked");
        if !responder.is_cancelled() {
            responder.fail(FailureReason::Handler(format!("method '{}' panicked", method)));
        }
    }
}

pub(crate) fn ensure_settled(responder: &Responder, method: &str) {
    if !responder.is_done() && !responder.is_cancelled() {
        tracing::warn!(%method, "call returned without an outcome");
        responder.fail(FailureReason::Handler(format!("method '{}' returned without an outcome", method)));
    }
}

/// Forwards an observed call into a responder, and the responder's
/// cancellation back into the call.
pub(crate) async fn relay(mut events: ObservableCall, responder: Responder) {
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(CallEvent::Next(data)) => {
                    responder.interim(data);
                }
                Some(CallEvent::Complete(data)) => {
                    responder.end(data);
                    return;
                }
                Some(CallEvent::Error(reason)) => {
                    responder.fail(reason);
                    return;
                }
                None => return,
            },
            _ = responder.cancelled() => {
                events.cancel();
                return;
            }
        }
    }
}

/// Calls `method` on `object` and waits for `end` or `error`.
pub async fn call_object(object: &Cap, method: &str, args: Option<Envelope>) -> CallResult {
    let (responder, mut outcomes, _cancel) = Responder::local();
    let call = ServedCall { method: method.to_string(), args, responder };

    let wait = async move {
        while let Some(outcome) = outcomes.recv().await {
            match outcome {
                Outcome::Interim(_) => continue,
                Outcome::End(data) => return Ok(data),
                Outcome::Error(reason) => return Err(reason),
            }
        }
        Err(FailureReason::Handler(format!("method '{}' produced no outcome", method)))
    };

    let ((), result) = tokio::join!(dispatch_isolated(object.clone(), call), wait);
    result
}

/// Calls `method` on `object` and streams every outcome.
pub fn observe_object(object: &Cap, method: &str, args: Option<Envelope>) -> ObservableCall {
    let (responder, outcomes, cancel_tx) = Responder::local();
    let call = ServedCall { method: method.to_string(), args, responder };

    tokio::spawn(dispatch_isolated(object.clone(), call));

    let cancel = CancelHandle::new(move || {
        cancel_tx.send_replace(true);
    });
    ObservableCall::new(outcomes, cancel)
}

/// Identity of a capability, stable for as long as it is alive.
pub(crate) fn identity(object: &Cap) -> usize {
    Arc::as_ptr(object) as *const () as usize
}
