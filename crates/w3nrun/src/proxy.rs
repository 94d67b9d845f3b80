//! Proxies for objects owned by the other side of a link.

use std::sync::Arc;
use std::sync::Weak;

use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;
use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;
use w3nrpc::ObjectReference;
use w3nrpc::RpcException;

use crate::capability::CapObject;
use crate::capability::RemoteRef;
use crate::capability::ServedCall;
use crate::capability::relay;
use crate::connection::ConnInner;

/// Forwards every call to the owner of `reference`.
///
/// Holds its link weakly; once the link is closed every call fails with
/// `connectionClosed`.
pub struct RemoteObject {
    conn: Weak<ConnInner>,
    link: u64,
    reference: ObjectReference,
    app_domain: String,
    service: String,
}

impl RemoteObject {
    pub(crate) fn new(conn: &Arc<ConnInner>, reference: ObjectReference) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            link: conn.link(),
            reference,
            app_domain: conn.config().app_domain.clone(),
            service: conn.config().service.clone(),
        }
    }

    pub fn reference(&self) -> &ObjectReference {
        &self.reference
    }
}

#[async_trait::async_trait]
impl CapObject for RemoteObject {
    fn kind(&self) -> ObjectKind {
        self.reference.kind
    }

    async fn invoke(&self, call: ServedCall) {
        let Some(conn) = self.conn.upgrade() else {
            let exc = RpcException::new(
                &self.app_domain,
                &self.service,
                ExceptionKind::ConnectionClosed(CloseReason::Local),
            ).with_method(&call.method);
            call.responder.fail(FailureReason::Rpc(exc));
            return;
        };

        let events = conn.observe_at(Some(self.reference.path.clone()), &call.method, call.args);
        relay(events, call.responder).await;
    }

    fn remote_ref(&self) -> Option<RemoteRef> {
        Some(RemoteRef { link: self.link, reference: self.reference.clone() })
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("link", &self.link)
            .field("reference", &self.reference)
            .finish()
    }
}
