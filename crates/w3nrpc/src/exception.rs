//! # Platform Exceptions
//!
//! `RpcException` reports why a connect, an expose, or a call was refused.
//! In memory the cause is a closed enum. On the wire it is the flat map the
//! platform has always used, `{ type: "rpc", appDomain, service, <marker>: true }`,
//! with exactly one boolean marker set.

use w3npack::Decoder;
use w3npack::Encoder;

use crate::error::Error;
use crate::error::Result;

/// Which side ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// `close()` was called on this side.
    Local,
    /// The peer sent an orderly close.
    Peer,
    /// The transport broke without an orderly close.
    TransportFailure,
}

impl CloseReason {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Peer => "peer",
            Self::TransportFailure => "transport",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "local" => Ok(Self::Local),
            "peer" => Ok(Self::Peer),
            "transport" => Ok(Self::TransportFailure),
            other => Err(Error::UnknownVariant(other.to_string())),
        }
    }
}

/// The single cause carried by an `RpcException`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    CallerNotAllowed,
    ConnectionNotAccepted,
    ServiceAlreadyExposed,
    ServiceNotFound,
    ConnectionAlreadyWatched,
    ConnectionClosed(CloseReason),
    /// An object reference resolved to nothing on the side that should own it.
    UnknownReference,
    /// An object reference named a kind this side cannot proxy.
    UnsupportedKind(String),
}

impl ExceptionKind {
    /// The boolean marker field used on the wire.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::CallerNotAllowed => "callerNotAllowed",
            Self::ConnectionNotAccepted => "connectionNotAccepted",
            Self::ServiceAlreadyExposed => "serviceAlreadyExposed",
            Self::ServiceNotFound => "serviceNotFound",
            Self::ConnectionAlreadyWatched => "connectionAlreadyWatched",
            Self::ConnectionClosed(_) => "connectionClosed",
            Self::UnknownReference => "unknownReference",
            Self::UnsupportedKind(_) => "unsupportedKind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcException {
    pub app_domain: String,
    pub service: String,
    pub caller_app: Option<String>,
    pub caller_component: Option<String>,
    /// Method in progress when the failure happened, if any.
    pub method: Option<String>,
    pub kind: ExceptionKind,
}

impl RpcException {
    pub fn new(app_domain: impl Into<String>, service: impl Into<String>, kind: ExceptionKind) -> Self {
        Self {
            app_domain: app_domain.into(),
            service: service.into(),
            caller_app: None,
            caller_component: None,
            method: None,
            kind,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_caller(mut self, app: Option<String>, component: Option<String>) -> Self {
        self.caller_app = app;
        self.caller_component = component;
        self
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self.kind, ExceptionKind::ConnectionClosed(_))
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        enc.entry("type", |e| e.str("rpc"))?;
        enc.entry("appDomain", |e| e.str(&self.app_domain))?;
        enc.entry("service", |e| e.str(&self.service))?;
        if let Some(app) = &self.caller_app {
            enc.entry("callerApp", |e| e.str(app))?;
        }
        if let Some(component) = &self.caller_component {
            enc.entry("callerComponent", |e| e.str(component))?;
        }
        if let Some(method) = &self.method {
            enc.entry("method", |e| e.str(method))?;
        }
        enc.entry(self.kind.marker(), |e| e.bool(true))?;
        match &self.kind {
            ExceptionKind::ConnectionClosed(reason) => {
                enc.entry("closeReason", |e| e.str(reason.as_tag()))?;
            }
            ExceptionKind::UnsupportedKind(kind) => {
                enc.entry("objectKind", |e| e.str(kind))?;
            }
            _ => {}
        }
        enc.map_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut is_rpc = false;
        let mut app_domain = None;
        let mut service = None;
        let mut caller_app = None;
        let mut caller_component = None;
        let mut method = None;
        let mut markers: Vec<&str> = Vec::new();
        let mut close_reason = None;
        let mut object_kind = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "type" => is_rpc = val.str()? == "rpc",
                "appDomain" => app_domain = Some(val.str()?.to_string()),
                "service" => service = Some(val.str()?.to_string()),
                "callerApp" => caller_app = Some(val.str()?.to_string()),
                "callerComponent" => caller_component = Some(val.str()?.to_string()),
                "method" => method = Some(val.str()?.to_string()),
                "closeReason" => close_reason = Some(CloseReason::from_tag(val.str()?)?),
                "objectKind" => object_kind = Some(val.str()?.to_string()),
                "callerNotAllowed" | "connectionNotAccepted" | "serviceAlreadyExposed"
                | "serviceNotFound" | "connectionAlreadyWatched" | "connectionClosed"
                | "unknownReference" | "unsupportedKind" => {
                    if val.bool()? {
                        markers.push(key);
                    }
                }
                _ => val.skip()?,
            }
        }

        if !is_rpc {
            return Err(Error::ProtocolViolation("exception is not of type 'rpc'".into()));
        }

        // a sender is expected to set one marker; the first one wins otherwise
        let marker = markers.first()
            .ok_or(Error::ProtocolViolation("exception carries no cause marker".into()))?;
        let kind = match *marker {
            "callerNotAllowed" => ExceptionKind::CallerNotAllowed,
            "connectionNotAccepted" => ExceptionKind::ConnectionNotAccepted,
            "serviceAlreadyExposed" => ExceptionKind::ServiceAlreadyExposed,
            "serviceNotFound" => ExceptionKind::ServiceNotFound,
            "connectionAlreadyWatched" => ExceptionKind::ConnectionAlreadyWatched,
            "connectionClosed" => ExceptionKind::ConnectionClosed(close_reason.unwrap_or(CloseReason::Peer)),
            "unknownReference" => ExceptionKind::UnknownReference,
            _ => ExceptionKind::UnsupportedKind(object_kind.unwrap_or_default()),
        };

        Ok(Self {
            app_domain: app_domain.ok_or(Error::MissingField("appDomain"))?,
            service: service.ok_or(Error::MissingField("service"))?,
            caller_app,
            caller_component,
            method,
            kind,
        })
    }
}

impl std::fmt::Display for RpcException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc exception ({}) for service '{}' of app '{}'", self.kind.marker(), self.service, self.app_domain)?;
        if let Some(method) = &self.method {
            write!(f, " in method '{}'", method)?;
        }
        if let ExceptionKind::ConnectionClosed(reason) = &self.kind {
            write!(f, ", closed by {}", reason.as_tag())?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcException {}
