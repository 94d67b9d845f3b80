//! # Object Reference Registry
//!
//! Per-connection bookkeeping for objects passed by reference.
//!
//! - **Exports**: local objects the peer may call. Each gets a path
//!   `[prefix, n]`, where the prefix names this side of the link, so the two
//!   sides never hand out the same path. Exporting the same object again
//!   returns the path it already has.
//! - **Imports**: proxies for the peer's objects, one per reference, so the
//!   same reference always resolves to the same proxy.
//!
//! Both tables are dropped when the connection closes.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use w3nrpc::ObjectPath;
use w3nrpc::ObjectReference;

use crate::capability::Cap;
use crate::capability::identity;

pub(crate) struct ObjectRegistry {
    prefix: &'static str,
    next_id: AtomicU64,
    exports: DashMap<ObjectPath, Cap>,
    by_identity: DashMap<usize, ObjectPath>,
    imports: DashMap<ObjectReference, Cap>,
}

impl ObjectRegistry {
    pub(crate) fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            next_id: AtomicU64::new(1),
            exports: DashMap::new(),
            by_identity: DashMap::new(),
            imports: DashMap::new(),
        }
    }

    /// Registers `object` if needed and returns its reference.
    pub(crate) fn export(&self, object: &Cap) -> ObjectReference {
        let path = self.by_identity
            .entry(identity(object))
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let path = vec![self.prefix.to_string(), id.to_string()];
                self.exports.insert(path.clone(), object.clone());
                tracing::trace!(kind = %object.kind(), ?path, "exported object");
                path
            })
            .clone();
        ObjectReference::new(object.kind(), path)
    }

    pub(crate) fn exported(&self, path: &[String]) -> Option<Cap> {
        self.exports.get(path).map(|e| e.value().clone())
    }

    /// Whether `path` was handed out by this side.
    pub(crate) fn owns(&self, path: &[String]) -> bool {
        path.first().is_some_and(|p| p == self.prefix)
    }

    /// Returns the proxy for `reference`, creating it with `make` on first use.
    pub(crate) fn import(&self, reference: &ObjectReference, make: impl FnOnce() -> Cap) -> Cap {
        self.imports.entry(reference.clone()).or_insert_with(make).value().clone()
    }

    pub(crate) fn export_count(&self) -> usize {
        self.exports.len()
    }

    pub(crate) fn import_count(&self) -> usize {
        self.imports.len()
    }

    pub(crate) fn clear(&self) {
        self.exports.clear();
        self.by_identity.clear();
        self.imports.clear();
    }
}
