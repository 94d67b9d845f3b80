//! # Typed Capabilities
//!
//! The kinds of object the platform passes around, each as a pair:
//!
//! - a **view**, the typed API a caller uses. It wraps any `Cap` of the
//!   right kind, local or proxied, and turns method calls into envelopes.
//! - an **in-memory object** implementing `CapObject`, for hosting the
//!   kind without a real filesystem.
//!
//! Arguments and structured replies are w3npack maps in the envelope bytes.
//! Objects travel in the envelope caps.

pub mod conn;
pub mod file;
pub mod fs;
pub mod sink;
pub mod source;

use std::sync::Mutex;
use std::sync::MutexGuard;

use w3npack::Decoder;
use w3npack::Encoder;
use w3npack::ListIter;
use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::capability::Cap;
use crate::capability::Envelope;
use crate::error::Error;
use crate::error::Result;

/// Encodes a map of arguments or reply fields.
pub(crate) fn encode_fields(fields: impl FnOnce(&mut Encoder) -> w3npack::Result<()>) -> w3npack::Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    fields(&mut enc)?;
    enc.map_end()?;
    enc.into_bytes()
}

/// The entries of a decoded map, looked up by key.
pub(crate) struct Fields<'a> {
    entries: Vec<(&'a str, Decoder<'a>)>,
}

impl<'a> Fields<'a> {
    pub(crate) fn parse(bytes: &'a [u8]) -> w3npack::Result<Self> {
        let mut dec = Decoder::new(bytes);
        let mut map = dec.map()?;
        let mut entries = Vec::new();
        while let Some(entry) = map.next()? {
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Empty when there are no argument bytes at all.
    pub(crate) fn of(args: Option<&'a [u8]>) -> w3npack::Result<Self> {
        match args {
            Some(bytes) => Self::parse(bytes),
            None => Ok(Self { entries: Vec::new() }),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Decoder<'a>> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
    }

    pub(crate) fn u64(&self, key: &str) -> w3npack::Result<Option<u64>> {
        self.get(key).map(|mut d| d.u64()).transpose()
    }

    pub(crate) fn bool(&self, key: &str) -> w3npack::Result<Option<bool>> {
        self.get(key).map(|mut d| d.bool()).transpose()
    }

    pub(crate) fn str(&self, key: &str) -> w3npack::Result<Option<&'a str>> {
        self.get(key).map(|mut d| d.str()).transpose()
    }

    pub(crate) fn bytes(&self, key: &str) -> w3npack::Result<Option<&'a [u8]>> {
        self.get(key).map(|mut d| d.bytes()).transpose()
    }

    pub(crate) fn list(&self, key: &str) -> w3npack::Result<Option<ListIter<'a>>> {
        self.get(key).map(|mut d| d.list()).transpose()
    }
}

/// Reads the argument map of a served call.
pub(crate) fn parse_args(args: Option<&[u8]>) -> std::result::Result<Fields<'_>, FailureReason> {
    Fields::of(args).map_err(bad_args)
}

pub(crate) fn bad_args(e: w3npack::Error) -> FailureReason {
    FailureReason::ProtocolViolation(format!("bad arguments: {}", e))
}

pub(crate) fn required<T>(value: Option<T>, key: &'static str) -> std::result::Result<T, FailureReason> {
    value.ok_or_else(|| FailureReason::ProtocolViolation(format!("missing argument '{}'", key)))
}

/// Encodes a reply map into an envelope.
pub(crate) fn reply_fields(fields: impl FnOnce(&mut Encoder) -> w3npack::Result<()>) -> std::result::Result<Option<Envelope>, FailureReason> {
    encode_fields(fields)
        .map(|bytes| Some(Envelope::bytes(bytes)))
        .map_err(|e| FailureReason::Handler(format!("reply failed to encode: {}", e)))
}

pub(crate) fn args(fields: impl FnOnce(&mut Encoder) -> w3npack::Result<()>) -> Result<Option<Envelope>> {
    Ok(Some(Envelope::bytes(encode_fields(fields)?)))
}

pub(crate) fn reply_bytes(reply: Option<Envelope>) -> Result<Vec<u8>> {
    reply.and_then(|r| r.bytes).ok_or(Error::MissingReply("bytes"))
}

/// First object of a reply, checked against the kind the method returns.
pub(crate) fn reply_cap(reply: Option<Envelope>, kind: ObjectKind) -> Result<Cap> {
    let object = reply
        .and_then(|r| r.caps)
        .and_then(|caps| caps.into_iter().next())
        .ok_or(Error::MissingReply("object"))?;
    expect_kind(&object, kind)?;
    Ok(object)
}

pub(crate) fn unknown_method(kind: ObjectKind, method: &str) -> FailureReason {
    FailureReason::MethodNotFound(format!("{}.{}", kind, method))
}

pub(crate) fn expect_kind(object: &Cap, expected: ObjectKind) -> Result<()> {
    let found = object.kind();
    if found != expected {
        return Err(Error::WrongKind { expected, found });
    }
    Ok(())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
