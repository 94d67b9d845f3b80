//! # Configuration
//!
//! Static description of the apps a `Platform` hosts and of single links.
//!
//! An app declares the services it may expose in its `AppManifest`, each with
//! the set of callers allowed to connect. Connect attempts are checked
//! against these declarations before any link is made.

use std::collections::BTreeMap;

/// Who may connect to a service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowedCallers {
    /// Only components of the app that exposes the service.
    #[default]
    ThisApp,
    /// Any app on the platform.
    AnyApp,
    /// The exposing app plus the listed app domains.
    Apps(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceAccess {
    pub allowed: AllowedCallers,
}

impl ServiceAccess {
    pub fn this_app() -> Self {
        Self { allowed: AllowedCallers::ThisApp }
    }

    pub fn any_app() -> Self {
        Self { allowed: AllowedCallers::AnyApp }
    }

    pub fn apps<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed: AllowedCallers::Apps(domains.into_iter().map(Into::into).collect()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppManifest {
    pub domain: String,
    pub services: BTreeMap<String, ServiceAccess>,
}

impl AppManifest {
    pub fn new(domain: impl Into<String>) -> Self {
        Self { domain: domain.into(), services: BTreeMap::new() }
    }

    pub fn service(mut self, name: impl Into<String>, access: ServiceAccess) -> Self {
        self.services.insert(name.into(), access);
        self
    }

    pub fn declares(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Whether `caller_domain` may connect to `service`.
    ///
    /// Undeclared services allow nobody.
    pub fn allows(&self, service: &str, caller_domain: &str) -> bool {
        let Some(access) = self.services.get(service) else {
            return false;
        };
        if caller_domain == self.domain {
            return true;
        }
        match &access.allowed {
            AllowedCallers::ThisApp => false,
            AllowedCallers::AnyApp => true,
            AllowedCallers::Apps(domains) => domains.iter().any(|d| d == caller_domain),
        }
    }
}

/// Names one side of a link, and what its exceptions report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    /// Used in logs only.
    pub name: String,
    /// The app that exposes the service on this link.
    pub app_domain: String,
    pub service: String,
    pub caller_app: Option<String>,
    pub caller_component: Option<String>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn service(mut self, app_domain: impl Into<String>, service: impl Into<String>) -> Self {
        self.app_domain = app_domain.into();
        self.service = service.into();
        self
    }

    pub fn caller(mut self, app: impl Into<String>, component: Option<String>) -> Self {
        self.caller_app = Some(app.into());
        self.caller_component = component;
        self
    }
}
