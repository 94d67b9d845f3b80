//! # Service Exposure
//!
//! A `Platform` hosts apps. Each app gets a `ServiceRegistry`, through which
//! it exposes services and connects to services of its own or other apps.
//!
//! There is no process-global state: the platform is built once by whoever
//! composes the process and handed to the apps.
//!
//! ## Connect
//!
//! A connect is checked in order: the target app and service must be
//! declared, the caller must be allowed, the service must be exposed, and its
//! listener must still accept. The first failing check decides the
//! exception. On success both ends of an in-process link are made; the
//! listener gets the `IncomingConnection`, the caller gets the `Connection`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use w3nrpc::CloseReason;
use w3nrpc::ExceptionKind;
use w3nrpc::RpcException;

use crate::channel;
use crate::config::AppManifest;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::connection::Side;
use crate::error::Error;
use crate::error::Result;
use crate::incoming::IncomingConnection;

type ListenerItem = std::result::Result<IncomingConnection, RpcException>;

struct Exposed {
    token: u64,
    tx: mpsc::UnboundedSender<ListenerItem>,
}

struct PlatformInner {
    apps: BTreeMap<String, AppManifest>,
    exposed: DashMap<(String, String), Exposed>,
    next_token: AtomicU64,
    next_link: AtomicU64,
}

/// Fluent builder for a `Platform`.
#[derive(Debug, Default)]
pub struct PlatformBuilder {
    apps: Vec<AppManifest>,
}

impl PlatformBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app(mut self, manifest: AppManifest) -> Self {
        self.apps.push(manifest);
        self
    }

    pub fn build(self) -> Platform {
        let apps = self.apps.into_iter().map(|m| (m.domain.clone(), m)).collect();
        Platform {
            inner: Arc::new(PlatformInner {
                apps,
                exposed: DashMap::new(),
                next_token: AtomicU64::new(1),
                next_link: AtomicU64::new(1),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::new()
    }

    /// The registry for one component of an installed app.
    pub fn registry(&self, app_domain: &str, component: Option<&str>) -> Result<ServiceRegistry> {
        if !self.inner.apps.contains_key(app_domain) {
            return Err(Error::UnknownApp(app_domain.to_string()));
        }
        Ok(ServiceRegistry {
            platform: self.clone(),
            app_domain: app_domain.to_string(),
            component: component.map(str::to_string),
        })
    }

    pub fn apps(&self) -> impl Iterator<Item = &str> {
        self.inner.apps.keys().map(String::as_str)
    }

    /// Completes every listener of every app.
    pub fn shutdown(&self) {
        let count = self.inner.exposed.len();
        self.inner.exposed.clear();
        tracing::info!(listeners = count, "platform shut down");
    }

    fn exception(&self, app_domain: &str, service: &str, kind: ExceptionKind) -> RpcException {
        RpcException::new(app_domain, service, kind)
    }

    fn unregister(&self, key: &(String, String), token: u64) {
        if self.inner.exposed.remove_if(key, |_, e| e.token == token).is_some() {
            tracing::debug!(app = %key.0, service = %key.1, "service withdrawn");
        }
    }

    fn connect(&self, from: &ServiceRegistry, app_domain: &str, service: &str) -> std::result::Result<Connection, RpcException> {
        let caller = (Some(from.app_domain.clone()), from.component.clone());
        let refuse = |kind| self.exception(app_domain, service, kind).with_caller(caller.0.clone(), caller.1.clone());

        let Some(manifest) = self.inner.apps.get(app_domain) else {
            return Err(refuse(ExceptionKind::ServiceNotFound));
        };
        if !manifest.declares(service) {
            return Err(refuse(ExceptionKind::ServiceNotFound));
        }
        if !manifest.allows(service, &from.app_domain) {
            tracing::debug!(caller = %from.app_domain, app = app_domain, service, "caller not allowed");
            return Err(refuse(ExceptionKind::CallerNotAllowed));
        }

        let key = (app_domain.to_string(), service.to_string());
        let Some(listener) = self.inner.exposed.get(&key).map(|e| e.tx.clone()) else {
            return Err(refuse(ExceptionKind::ServiceNotFound));
        };

        let link = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let (client_end, service_end) = channel::link();
        let client_config = ConnectionConfig::new(format!("{}/{}#{}", app_domain, service, link))
            .service(app_domain, service)
            .caller(from.app_domain.clone(), from.component.clone());
        let service_config = client_config.clone();

        let client = Connection::open(client_config, Side::Client, Box::new(client_end));
        let incoming = IncomingConnection::new(Connection::open(service_config, Side::Service, Box::new(service_end)));

        if listener.send(Ok(incoming.clone())).is_err() {
            let client = client.clone();
            tokio::spawn(async move {
                incoming.close().await;
                client.close().await;
            });
            return Err(refuse(ExceptionKind::ConnectionNotAccepted));
        }

        tracing::debug!(caller = %from.app_domain, app = app_domain, service, link, "connected");
        Ok(client)
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("apps", &self.inner.apps.keys().collect::<Vec<_>>())
            .field("exposed", &self.inner.exposed.len())
            .finish()
    }
}

/// One app component's view of the platform.
#[derive(Clone, Debug)]
pub struct ServiceRegistry {
    platform: Platform,
    app_domain: String,
    component: Option<String>,
}

impl ServiceRegistry {
    pub fn app_domain(&self) -> &str {
        &self.app_domain
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    /// Starts listening for connections to `service` of this app.
    ///
    /// Fails with `serviceNotFound` if the manifest does not declare it and
    /// with `serviceAlreadyExposed` while another listener holds it.
    pub fn expose_service(&self, service: &str) -> std::result::Result<ServiceListener, RpcException> {
        let inner = &self.platform.inner;
        let refuse = |kind| RpcException::new(&self.app_domain, service, kind);

        let declared = inner.apps.get(&self.app_domain).is_some_and(|m| m.declares(service));
        if !declared {
            return Err(refuse(ExceptionKind::ServiceNotFound));
        }

        let key = (self.app_domain.clone(), service.to_string());
        let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        match inner.exposed.entry(key.clone()) {
            Entry::Occupied(_) => return Err(refuse(ExceptionKind::ServiceAlreadyExposed)),
            Entry::Vacant(slot) => {
                slot.insert(Exposed { token, tx });
            }
        }

        tracing::info!(app = %self.app_domain, service, "service exposed");
        Ok(ServiceListener { rx, platform: self.platform.clone(), key, token, active: true })
    }

    /// Connects to `service` of this same app.
    pub async fn this_app(&self, service: &str) -> std::result::Result<Connection, RpcException> {
        self.platform.connect(self, &self.app_domain, service)
    }

    /// Connects to `service` of `app_domain`.
    pub async fn other_app(&self, app_domain: &str, service: &str) -> std::result::Result<Connection, RpcException> {
        self.platform.connect(self, app_domain, service)
    }

    /// Fails every listener of this app with `connectionClosed` and
    /// withdraws its services.
    pub fn abort(&self) {
        let keys: Vec<(String, String)> = self.platform.inner.exposed.iter()
            .filter(|e| e.key().0 == self.app_domain)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, exposed)) = self.platform.inner.exposed.remove(&key) {
                let exc = RpcException::new(&key.0, &key.1, ExceptionKind::ConnectionClosed(CloseReason::TransportFailure));
                let _ = exposed.tx.send(Err(exc));
            }
        }
        tracing::warn!(app = %self.app_domain, "app services aborted");
    }
}

/// Delivers connections made to one exposed service.
///
/// Dropping it, or calling `unsubscribe`, withdraws the service.
pub struct ServiceListener {
    rx: mpsc::UnboundedReceiver<ListenerItem>,
    platform: Platform,
    key: (String, String),
    token: u64,
    active: bool,
}

impl ServiceListener {
    /// The next connection. `Some(Err(_))` reports a listener-level failure
    /// and is always the last item. `None` once the listener completed.
    pub async fn next(&mut self) -> Option<ListenerItem> {
        self.rx.recv().await
    }

    pub fn service(&self) -> &str {
        &self.key.1
    }

    /// Keeps the service name taken but refuses new connections with
    /// `connectionNotAccepted`.
    pub fn stop_accepting(&mut self) {
        self.rx.close();
    }

    pub fn unsubscribe(mut self) {
        self.withdraw();
    }

    fn withdraw(&mut self) {
        if self.active {
            self.active = false;
            self.platform.unregister(&self.key, self.token);
        }
    }
}

impl Drop for ServiceListener {
    fn drop(&mut self) {
        self.withdraw();
    }
}

impl std::fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceListener")
            .field("app", &self.key.0)
            .field("service", &self.key.1)
            .field("active", &self.active)
            .finish()
    }
}
