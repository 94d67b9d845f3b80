//! # Method Router
//!
//! Maps method names to handlers. Used to serve a root service and to build
//! capability objects without writing a `CapObject` by hand.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::call::CallResult;
use crate::capability::CapObject;
use crate::capability::Envelope;
use crate::capability::ServedCall;
use crate::capability::ensure_settled;

/// Serves one method.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, call: ServedCall);
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(ServedCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, call: ServedCall) {
        (self)(call).await
    }
}

#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler that settles the call itself, e.g. one that streams.
    pub fn route(mut self, method: impl Into<String>, handler: impl Handler) -> Self {
        self.routes.insert(method.into(), Arc::new(handler));
        self
    }

    /// Adds a request-reply handler.
    pub fn reply<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Envelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let f = Arc::new(f);
        self.route(method, move |call: ServedCall| {
            let f = f.clone();
            async move {
                let result = f(call.args).await;
                call.responder.settle(result);
            }
        })
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Serves `call`, or fails it with `MethodNotFound`.
    pub async fn dispatch(&self, call: ServedCall) {
        match self.routes.get(&call.method) {
            Some(handler) => {
                let responder = call.responder.clone();
                let method = call.method.clone();
                handler.handle(call).await;
                ensure_settled(&responder, &method);
            }
            None => {
                tracing::debug!(method = %call.method, "no handler for method");
                let method = call.method.clone();
                call.responder.fail(FailureReason::MethodNotFound(method));
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A capability object of any kind, served by a `Router`.
pub struct RoutedObject {
    kind: ObjectKind,
    router: Router,
}

impl RoutedObject {
    pub fn new(kind: ObjectKind, router: Router) -> Self {
        Self { kind, router }
    }
}

#[async_trait::async_trait]
impl CapObject for RoutedObject {
    fn kind(&self) -> ObjectKind {
        self.kind
    }

    async fn invoke(&self, call: ServedCall) {
        self.router.dispatch(call).await;
    }
}
