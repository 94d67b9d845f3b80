//! # Capability Marshaller
//!
//! Converts between what calls carry in memory (`Envelope`, with live
//! objects) and what travels (`Datum`, with references).
//!
//! Outbound, each object becomes a reference: a proxy for an object the peer
//! owns goes back as the peer's own reference, anything else is exported.
//! Inbound, a reference into this side's exports yields the original object,
//! anything else yields the proxy for it.

use std::sync::Arc;

use w3nrpc::Datum;
use w3nrpc::ExceptionKind;
use w3nrpc::ObjectKind;
use w3nrpc::ObjectReference;

use crate::capability::Cap;
use crate::capability::Envelope;
use crate::connection::ConnInner;
use crate::proxy::RemoteObject;

pub(crate) fn pack(conn: &ConnInner, envelope: Envelope) -> Datum {
    let refs = envelope.caps.map(|caps| {
        caps.iter().map(|object| reference_for(conn, object)).collect()
    });
    Datum { bytes: envelope.bytes, refs }
}

fn reference_for(conn: &ConnInner, object: &Cap) -> ObjectReference {
    if let Some(remote) = object.remote_ref() {
        if remote.link == conn.link() {
            return remote.reference;
        }
    }
    conn.registry.export(object)
}

pub(crate) fn unpack(conn: &Arc<ConnInner>, datum: Datum) -> Result<Envelope, ExceptionKind> {
    let caps = match datum.refs {
        Some(refs) => Some(
            refs.iter()
                .map(|r| resolve(conn, r))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };
    Ok(Envelope { bytes: datum.bytes, caps })
}

fn resolve(conn: &Arc<ConnInner>, reference: &ObjectReference) -> Result<Cap, ExceptionKind> {
    if conn.registry.owns(&reference.path) {
        let object = conn.registry.exported(&reference.path)
            .ok_or(ExceptionKind::UnknownReference)?;
        if object.kind() != reference.kind {
            tracing::debug!(
                expected = %reference.kind,
                found = %object.kind(),
                "reference kind does not match exported object",
            );
            return Err(ExceptionKind::UnknownReference);
        }
        return Ok(object);
    }
    Ok(conn.registry.import(reference, || make_proxy(conn, reference)))
}

/// Picks the proxy for a reference by kind.
///
/// Every kind is served by the same forwarding proxy; the typed views decide
/// which methods make sense. The match is exhaustive so that a new kind has
/// to be placed here.
fn make_proxy(conn: &Arc<ConnInner>, reference: &ObjectReference) -> Cap {
    match reference.kind {
        ObjectKind::File
        | ObjectKind::FileByteSink
        | ObjectKind::FileByteSource
        | ObjectKind::FsImpl
        | ObjectKind::SymLink
        | ObjectKind::FsCollection
        | ObjectKind::FsItemsIterator
        | ObjectKind::IncomingConnection
        | ObjectKind::RpcConnection => Arc::new(RemoteObject::new(conn, reference.clone())),
    }
}
