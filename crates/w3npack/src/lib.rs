//! # w3npack
//!
//! The byte format underneath every w3n RPC frame.
//!
//! ## Philosophy
//!
//! - **Explicit State**: the encoder keeps a stack of open scopes and refuses
//!   writes that would produce a structurally invalid message.
//! - **TLV Layout**: `[Tag][Length?][Value]`, so a reader can skip any field it
//!   does not understand. Newer peers may add map keys without breaking older ones.
//! - **Zero Copy**: decoders are bounds-checked views into the received buffer.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Len: 4b][Body: Len]`
//!
//! Integers are little-endian.

#[cfg(test)]
mod tests;

/// Encoding and decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Byte is not a known `Tag`.
    InvalidTag(u8),
    /// Found a different tag than the one requested.
    UnexpectedTag { expected: Tag, found: Tag },
    /// String blob is not valid UTF-8.
    InvalidUtf8,
    /// Closed a scope other than the innermost open one.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// Tried to close the root scope.
    ScopeUnderflow,
    /// Tried to take the bytes while scopes are still open.
    ScopeStillOpen,
    /// Ran out of input.
    UnexpectedEnd,
    /// Blob or container body longer than `u32::MAX`.
    BlobTooLarge(usize),
    /// Wrote a second item into a scope that holds exactly one.
    TooManyItems(Scope),
    /// Closed a single-item scope without writing its item.
    EmptyScope(Scope),
    /// Wrote something other than a variant directly into a map.
    InvalidMapEntry,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTag(b) => write!(f, "invalid tag byte {:#04x}", b),
            Self::UnexpectedTag { expected, found } => {
                write!(f, "expected {:?}, found {:?}", expected, found)
            }
            Self::ScopeMismatch { expected, actual } => {
                write!(f, "scope mismatch: closing {:?} while {:?} is open", expected, actual)
            }
            Self::TooManyItems(s) => write!(f, "scope {:?} holds exactly one item", s),
            Self::EmptyScope(s) => write!(f, "scope {:?} closed without an item", s),
            Self::BlobTooLarge(n) => write!(f, "blob of {} bytes exceeds u32 length", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Type marker preceding every encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    BoolTrue = 0x01,
    BoolFalse = 0x02,
    U64 = 0x06,
    Unit = 0x0E,
    OptionNone = 0x0F,

    String = 0x10,
    Bytes = 0x11,

    List = 0x20,
    Map = 0x21,

    OptionSome = 0x30,
    Variant = 0x33,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Tag::BoolTrue),
            0x02 => Some(Tag::BoolFalse),
            0x06 => Some(Tag::U64),
            0x0E => Some(Tag::Unit),
            0x0F => Some(Tag::OptionNone),
            0x10 => Some(Tag::String),
            0x11 => Some(Tag::Bytes),
            0x20 => Some(Tag::List),
            0x21 => Some(Tag::Map),
            0x30 => Some(Tag::OptionSome),
            0x33 => Some(Tag::Variant),
            _ => None,
        }
    }

    /// Width of the fixed payload following the tag, `None` for length-prefixed tags.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::BoolTrue | Tag::BoolFalse | Tag::Unit | Tag::OptionNone => Some(0),
            Tag::U64 => Some(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::OptionSome | Tag::Variant => None,
        }
    }
}

/// Kind of an open container on the encoder stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The virtual root; any number of items.
    Root,
    /// Any number of items.
    List,
    /// Only variants (key/value pairs).
    Map,
    /// Exactly one item.
    Option,
    /// Exactly one payload item after the name.
    Variant,
}

struct Frame {
    start: usize,
    scope: Scope,
    count: usize,
}

/// Scope-checked encoder that back-patches container lengths on close.
///
/// # Structural Invariants
///
/// 1. Map scopes only accept variants.
/// 2. Option and Variant scopes hold exactly one item.
/// 3. Bytes can only be taken once every scope but the root is closed.
pub struct Encoder {
    buf: Vec<u8>,
    stack: Vec<Frame>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            stack: vec![Frame { start: 0, scope: Scope::Root, count: 0 }],
        }
    }

    /// Consumes the encoder and returns the finished message.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if self.stack.len() > 1 {
            return Err(Error::ScopeStillOpen);
        }
        Ok(self.buf)
    }

    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn check_write(&mut self, tag: Tag) -> Result<()> {
        let frame = self.top();
        match frame.scope {
            Scope::Root | Scope::List => Ok(()),
            Scope::Map if tag == Tag::Variant => Ok(()),
            Scope::Map => Err(Error::InvalidMapEntry),
            Scope::Option | Scope::Variant if frame.count >= 1 => Err(Error::TooManyItems(frame.scope)),
            Scope::Option | Scope::Variant => Ok(()),
        }
    }

    fn written(&mut self) {
        self.top().count += 1;
    }

    fn scalar(&mut self, tag: Tag, payload: &[u8]) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(payload);
        self.written();
        Ok(())
    }

    fn blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.written();
        Ok(())
    }

    fn begin(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.check_write(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0; 4]);
        self.stack.push(Frame { start: self.buf.len(), scope, count: 0 });
        Ok(())
    }

    fn end(&mut self, expected: Scope) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::ScopeUnderflow);
        }
        let frame = self.top();
        if frame.scope != expected {
            return Err(Error::ScopeMismatch { expected, actual: frame.scope });
        }
        if matches!(frame.scope, Scope::Option | Scope::Variant) && frame.count == 0 {
            return Err(Error::EmptyScope(frame.scope));
        }
        let start = frame.start;
        self.stack.pop();

        let body_len = self.buf.len() - start;
        let len = u32::try_from(body_len).map_err(|_| Error::BlobTooLarge(body_len))?;
        self.buf[start - 4..start].copy_from_slice(&len.to_le_bytes());
        self.written();
        Ok(())
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.scalar(if v { Tag::BoolTrue } else { Tag::BoolFalse }, &[])
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.scalar(Tag::U64, &v.to_le_bytes())
    }

    pub fn unit(&mut self) -> Result<()> {
        self.scalar(Tag::Unit, &[])
    }

    pub fn option_none(&mut self) -> Result<()> {
        self.scalar(Tag::OptionNone, &[])
    }

    pub fn str(&mut self, v: &str) -> Result<()> {
        self.blob(Tag::String, v.as_bytes())
    }

    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.blob(Tag::Bytes, v)
    }

    pub fn list_begin(&mut self) -> Result<()> { self.begin(Tag::List, Scope::List) }
    pub fn list_end(&mut self) -> Result<()> { self.end(Scope::List) }

    /// Opens a map. Entries are written as `variant_begin(key)`, value, `variant_end()`.
    pub fn map_begin(&mut self) -> Result<()> { self.begin(Tag::Map, Scope::Map) }
    pub fn map_end(&mut self) -> Result<()> { self.end(Scope::Map) }

    pub fn option_some_begin(&mut self) -> Result<()> { self.begin(Tag::OptionSome, Scope::Option) }
    pub fn option_some_end(&mut self) -> Result<()> { self.end(Scope::Option) }

    /// Opens a named payload. Exactly one item must follow before `variant_end`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.begin(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // the name is metadata, not the payload
        self.top().count = 0;
        Ok(())
    }
    pub fn variant_end(&mut self) -> Result<()> { self.end(Scope::Variant) }

    /// Writes `key => value` inside an open map.
    pub fn entry(&mut self, key: &str, value: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.variant_begin(key)?;
        value(self)?;
        self.variant_end()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked cursor over an encoded buffer.
///
/// Container reads hand back a new `Decoder` restricted to the container body.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn peek_tag(&self) -> Result<Tag> {
        let b = *self.buf.first().ok_or(Error::UnexpectedEnd)?;
        Tag::from_u8(b).ok_or(Error::InvalidTag(b))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.buf.len() {
            return Err(Error::UnexpectedEnd);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn read_len(&mut self) -> Result<usize> {
        let raw = self.take(4)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(raw);
        Ok(u32::from_le_bytes(len) as usize)
    }

    fn expect(&mut self, expected: Tag) -> Result<()> {
        let found = self.peek_tag()?;
        if found != expected {
            return Err(Error::UnexpectedTag { expected, found });
        }
        self.take(1)?;
        Ok(())
    }

    fn enter(&mut self, expected: Tag) -> Result<Decoder<'a>> {
        self.expect(expected)?;
        let len = self.read_len()?;
        Ok(Decoder::new(self.take(len)?))
    }

    /// Skips the next item, children included.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        match tag.fixed_width() {
            Some(width) => { self.take(width)?; }
            None => {
                let len = self.read_len()?;
                self.take(len)?;
            }
        }
        Ok(())
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.peek_tag()? {
            Tag::BoolTrue => { self.take(1)?; Ok(true) }
            Tag::BoolFalse => { self.take(1)?; Ok(false) }
            found => Err(Error::UnexpectedTag { expected: Tag::BoolTrue, found }),
        }
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.expect(Tag::U64)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn unit(&mut self) -> Result<()> {
        self.expect(Tag::Unit)
    }

    pub fn str(&mut self) -> Result<&'a str> {
        self.expect(Tag::String)?;
        let len = self.read_len()?;
        std::str::from_utf8(self.take(len)?).map_err(|_| Error::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.expect(Tag::Bytes)?;
        let len = self.read_len()?;
        self.take(len)
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        Ok(ListIter { dec: self.enter(Tag::List)? })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        Ok(MapIter { dec: self.enter(Tag::Map)? })
    }

    /// Returns the payload decoder for `Some`, or `None`.
    pub fn option(&mut self) -> Result<Option<Decoder<'a>>> {
        match self.peek_tag()? {
            Tag::OptionNone => { self.take(1)?; Ok(None) }
            Tag::OptionSome => Ok(Some(self.enter(Tag::OptionSome)?)),
            found => Err(Error::UnexpectedTag { expected: Tag::OptionSome, found }),
        }
    }

    /// Returns `(name, payload)`.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut inner = self.enter(Tag::Variant)?;
        let name = inner.str()?;
        Ok((name, inner))
    }
}

/// Items of a list, one sub-decoder each.
#[derive(Debug)]
pub struct ListIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        let mut probe = self.dec.clone();
        probe.skip()?;
        let len = self.dec.remaining() - probe.remaining();
        Ok(Some(Decoder::new(self.dec.take(len)?)))
    }
}

/// Key/value pairs of a map.
#[derive(Debug)]
pub struct MapIter<'a> {
    dec: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.dec.is_empty() {
            return Ok(None);
        }
        self.dec.variant().map(Some)
    }
}
