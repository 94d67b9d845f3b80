//! # Datum and Object References
//!
//! A `Datum` is what a call carries: optional raw bytes and optional
//! references to live objects. The references are only names; turning them
//! into something callable is the runtime's job.
//!
//! ## Invariants
//! - An absent datum (`Option::None` at the frame level) is distinct from a
//!   datum with neither field set. Both survive encoding.
//! - Reference order is preserved.

use w3npack::Decoder;
use w3npack::Encoder;

use crate::error::Error;
use crate::error::Result;

/// Every kind of object that can travel by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    File,
    FileByteSink,
    FileByteSource,
    FsImpl,
    SymLink,
    FsCollection,
    FsItemsIterator,
    IncomingConnection,
    RpcConnection,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 9] = [
        Self::File,
        Self::FileByteSink,
        Self::FileByteSource,
        Self::FsImpl,
        Self::SymLink,
        Self::FsCollection,
        Self::FsItemsIterator,
        Self::IncomingConnection,
        Self::RpcConnection,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::File => "File",
            Self::FileByteSink => "FileByteSink",
            Self::FileByteSource => "FileByteSource",
            Self::FsImpl => "FSImpl",
            Self::SymLink => "SymLink",
            Self::FsCollection => "FSCollection",
            Self::FsItemsIterator => "FSItemsIterator",
            Self::IncomingConnection => "IncomingConnection",
            Self::RpcConnection => "RPCConnection",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        Self::ALL.into_iter()
            .find(|k| k.as_tag() == tag)
            .ok_or_else(|| Error::UnsupportedKind(tag.to_string()))
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Registry key on the side that owns the object.
pub type ObjectPath = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub kind: ObjectKind,
    pub path: ObjectPath,
}

impl ObjectReference {
    pub fn new(kind: ObjectKind, path: ObjectPath) -> Self {
        Self { kind, path }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        enc.entry("kind", |e| e.str(self.kind.as_tag()))?;
        enc.entry("path", |e| encode_path(e, &self.path))?;
        enc.map_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut kind = None;
        let mut path = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "kind" => kind = Some(ObjectKind::from_tag(val.str()?)?),
                "path" => path = Some(decode_path(&mut val)?),
                _ => val.skip()?,
            }
        }

        Ok(Self {
            kind: kind.ok_or(Error::MissingField("kind"))?,
            path: path.ok_or(Error::MissingField("path"))?,
        })
    }
}

pub(crate) fn encode_path(enc: &mut Encoder, path: &[String]) -> w3npack::Result<()> {
    enc.list_begin()?;
    for segment in path {
        enc.str(segment)?;
    }
    enc.list_end()
}

pub(crate) fn decode_path(dec: &mut Decoder<'_>) -> Result<ObjectPath> {
    let mut items = dec.list()?;
    let mut path = Vec::new();
    while let Some(mut segment) = items.next()? {
        path.push(segment.str()?.to_string());
    }
    Ok(path)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datum {
    pub bytes: Option<Vec<u8>>,
    pub refs: Option<Vec<ObjectReference>>,
}

impl Datum {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { bytes: Some(bytes.into()), refs: None }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        if let Some(bytes) = &self.bytes {
            enc.entry("bytes", |e| e.bytes(bytes))?;
        }
        if let Some(refs) = &self.refs {
            enc.variant_begin("passedByReference")?;
            enc.list_begin()?;
            for r in refs {
                r.encode(enc)?;
            }
            enc.list_end()?;
            enc.variant_end()?;
        }
        enc.map_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut map = dec.map()?;
        let mut datum = Datum::default();

        while let Some((key, mut val)) = map.next()? {
            match key {
                "bytes" => datum.bytes = Some(val.bytes()?.to_vec()),
                "passedByReference" => {
                    let mut items = val.list()?;
                    let mut refs = Vec::new();
                    while let Some(mut item) = items.next()? {
                        refs.push(ObjectReference::decode(&mut item)?);
                    }
                    datum.refs = Some(refs);
                }
                _ => val.skip()?,
            }
        }

        Ok(datum)
    }
}

/// Encodes an optional datum, keeping absent apart from empty.
pub fn encode_opt_datum(enc: &mut Encoder, datum: Option<&Datum>) -> Result<()> {
    match datum {
        Some(d) => {
            enc.option_some_begin()?;
            d.encode(enc)?;
            enc.option_some_end()?;
        }
        None => enc.option_none()?,
    }
    Ok(())
}

pub fn decode_opt_datum(dec: &mut Decoder<'_>) -> Result<Option<Datum>> {
    match dec.option()? {
        Some(mut inner) => Ok(Some(Datum::decode(&mut inner)?)),
        None => Ok(None),
    }
}
