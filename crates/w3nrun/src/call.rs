//! # Call State Machine
//!
//! Every call a side issues is tracked until it reaches a terminal state.
//!
//! ```text
//!            interim (0..n)
//!             ┌──────┐
//!             ▼      │
//!   Start ──► Open ──┘──► Ended      (end)
//!              │  └─────► Errored    (error, incl. connection closed)
//!              └────────► Cancelled  (caller cancelled)
//! ```
//!
//! Once a call leaves `Open` it is removed from its table, so a late outcome
//! finds nothing to deliver to and is dropped.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use w3nrpc::CallStatus;
use w3nrpc::FailureReason;

use crate::capability::Envelope;

/// What a request-reply call settles with.
pub type CallResult = std::result::Result<Option<Envelope>, FailureReason>;

/// One outcome of a call, after references were resolved.
#[derive(Debug)]
pub enum Outcome {
    Interim(Option<Envelope>),
    End(Option<Envelope>),
    Error(FailureReason),
}

impl Outcome {
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Interim(_) => CallStatus::Interim,
            Self::End(_) => CallStatus::End,
            Self::Error(_) => CallStatus::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// What an observer of a call sees.
///
/// A `Complete` carries the `end` payload, if the callee sent one.
#[derive(Debug)]
pub enum CallEvent {
    Next(Option<Envelope>),
    Complete(Option<Envelope>),
    Error(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Open,
    Ended,
    Errored,
    Cancelled,
}

pub(crate) enum CallSink {
    /// Request-reply: interim outcomes are dropped.
    Reply(oneshot::Sender<CallResult>),
    Observe(mpsc::UnboundedSender<Outcome>),
}

/// An outgoing call awaiting outcomes.
pub(crate) struct Call {
    method: String,
    state: CallState,
    sink: Option<CallSink>,
}

impl Call {
    pub(crate) fn new(method: &str, sink: CallSink) -> Self {
        Self { method: method.to_string(), state: CallState::Open, sink: Some(sink) }
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CallState {
        self.state
    }

    /// Applies one outcome. Returns `true` if the call is now terminal.
    pub(crate) fn deliver(&mut self, outcome: Outcome) -> bool {
        if self.state != CallState::Open {
            tracing::trace!(method = %self.method, state = ?self.state, "outcome after terminal state dropped");
            return false;
        }

        match outcome {
            Outcome::Interim(data) => {
                match &self.sink {
                    Some(CallSink::Observe(tx)) => {
                        let _ = tx.send(Outcome::Interim(data));
                    }
                    _ => tracing::trace!(method = %self.method, "interim outcome on request-reply call dropped"),
                }
                false
            }
            Outcome::End(data) => {
                self.state = CallState::Ended;
                self.finish(Ok(data));
                true
            }
            Outcome::Error(reason) => {
                self.state = CallState::Errored;
                self.finish(Err(reason));
                true
            }
        }
    }

    /// Marks the call cancelled. Returns `false` if it had already finished.
    pub(crate) fn cancel(&mut self) -> bool {
        if self.state != CallState::Open {
            return false;
        }
        self.state = CallState::Cancelled;
        self.sink = None;
        true
    }

    fn finish(&mut self, result: CallResult) {
        match self.sink.take() {
            Some(CallSink::Reply(tx)) => {
                let _ = tx.send(result);
            }
            Some(CallSink::Observe(tx)) => {
                let outcome = match result {
                    Ok(data) => Outcome::End(data),
                    Err(reason) => Outcome::Error(reason),
                };
                let _ = tx.send(outcome);
            }
            None => {}
        }
    }
}

/// Cancels one observed call. Cloneable; only the first `cancel` acts.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    cancelled: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelHandle {
    pub(crate) fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let action = self.inner.action.lock().ok().and_then(|mut slot| slot.take());
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// The receiving end of an observed call.
///
/// Yields any number of `Next`, then at most one `Complete` or `Error`, then
/// `None` forever. After `cancel` it yields `None` without delivering anything
/// still in flight.
pub struct ObservableCall {
    events: mpsc::UnboundedReceiver<Outcome>,
    cancel: CancelHandle,
    done: bool,
}

impl ObservableCall {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<Outcome>, cancel: CancelHandle) -> Self {
        Self { events, cancel, done: false }
    }

    pub async fn next(&mut self) -> Option<CallEvent> {
        if self.done || self.cancel.is_cancelled() {
            return None;
        }

        let outcome = self.events.recv().await;
        if self.cancel.is_cancelled() {
            self.done = true;
            return None;
        }

        match outcome {
            Some(Outcome::Interim(data)) => Some(CallEvent::Next(data)),
            Some(Outcome::End(data)) => {
                self.done = true;
                Some(CallEvent::Complete(data))
            }
            Some(Outcome::Error(reason)) => {
                self.done = true;
                Some(CallEvent::Error(reason))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drains the call: every interim payload, then how it ended.
    pub async fn collect(mut self) -> (Vec<Option<Envelope>>, CallResult) {
        let mut interim = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                CallEvent::Next(data) => interim.push(data),
                CallEvent::Complete(data) => return (interim, Ok(data)),
                CallEvent::Error(reason) => return (interim, Err(reason)),
            }
        }
        let reason = FailureReason::Handler("call ended without an outcome".into());
        (interim, Err(reason))
    }
}
