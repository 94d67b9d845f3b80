//! Files.
//!
//! | method          | arguments          | reply                         |
//! |-----------------|--------------------|-------------------------------|
//! | `stat`          |                    | `{ name, size, writable }`    |
//! | `readBytes`     | `{ start?, end? }` | the bytes                     |
//! | `readTxt`       |                    | utf-8 bytes                   |
//! | `writeBytes`    | `{ bytes }`        |                               |
//! | `writeTxt`      | `{ text }`         |                               |
//! | `getByteSink`   | `{ truncate? }`    | a `FileByteSink`              |
//! | `getByteSource` |                    | a `FileByteSource`            |

use std::sync::Arc;
use std::sync::Mutex;

use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::call::CallResult;
use crate::capability::Cap;
use crate::capability::CapObject;
use crate::capability::Envelope;
use crate::capability::ServedCall;
use crate::capability::call_object;
use crate::caps::Fields;
use crate::caps::args;
use crate::caps::bad_args;
use crate::caps::expect_kind;
use crate::caps::lock;
use crate::caps::parse_args;
use crate::caps::reply_bytes;
use crate::caps::reply_cap;
use crate::caps::reply_fields;
use crate::caps::required;
use crate::caps::sink::ByteSinkView;
use crate::caps::sink::MemByteSink;
use crate::caps::source::ByteSourceView;
use crate::caps::source::MemByteSource;
use crate::caps::unknown_method;
use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub writable: bool,
}

/// Typed access to a `File`.
#[derive(Clone)]
pub struct FileView {
    object: Cap,
}

impl FileView {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::File)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    pub async fn stat(&self) -> Result<FileStat> {
        let reply = reply_bytes(call_object(&self.object, "stat", None).await?)?;
        let fields = Fields::parse(&reply)?;
        Ok(FileStat {
            name: fields.str("name")?.unwrap_or_default().to_string(),
            size: fields.u64("size")?.unwrap_or(0),
            writable: fields.bool("writable")?.unwrap_or(false),
        })
    }

    /// Reads `[start, end)`; either bound may be left open.
    pub async fn read_bytes(&self, start: Option<u64>, end: Option<u64>) -> Result<Vec<u8>> {
        let args = args(|e| {
            if let Some(start) = start {
                e.entry("start", |e| e.u64(start))?;
            }
            if let Some(end) = end {
                e.entry("end", |e| e.u64(end))?;
            }
            Ok(())
        })?;
        reply_bytes(call_object(&self.object, "readBytes", args).await?)
    }

    pub async fn read_txt(&self) -> Result<String> {
        let bytes = reply_bytes(call_object(&self.object, "readTxt", None).await?)?;
        String::from_utf8(bytes).map_err(|_| Error::Pack(w3npack::Error::InvalidUtf8))
    }

    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let args = args(|e| e.entry("bytes", |e| e.bytes(bytes)))?;
        call_object(&self.object, "writeBytes", args).await?;
        Ok(())
    }

    pub async fn write_txt(&self, text: &str) -> Result<()> {
        let args = args(|e| e.entry("text", |e| e.str(text)))?;
        call_object(&self.object, "writeTxt", args).await?;
        Ok(())
    }

    pub async fn get_byte_sink(&self, truncate: bool) -> Result<ByteSinkView> {
        let args = args(|e| e.entry("truncate", |e| e.bool(truncate)))?;
        let reply = call_object(&self.object, "getByteSink", args).await?;
        ByteSinkView::new(reply_cap(reply, ObjectKind::FileByteSink)?)
    }

    pub async fn get_byte_source(&self) -> Result<ByteSourceView> {
        let reply = call_object(&self.object, "getByteSource", None).await?;
        ByteSourceView::new(reply_cap(reply, ObjectKind::FileByteSource)?)
    }
}

/// A file held in memory.
pub struct MemFile {
    name: String,
    content: Arc<Mutex<Vec<u8>>>,
    writable: bool,
}

impl MemFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: Arc::new(Mutex::new(content.into())),
            writable: true,
        }
    }

    pub fn read_only(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self { writable: false, ..Self::new(name, content) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.content).clone()
    }

    pub(crate) fn replace(&self, bytes: Vec<u8>) {
        *lock(&self.content) = bytes;
    }

    fn check_writable(&self) -> std::result::Result<(), FailureReason> {
        if !self.writable {
            return Err(FailureReason::Handler(format!("file '{}' is read-only", self.name)));
        }
        Ok(())
    }

    fn serve(&self, call: &ServedCall) -> CallResult {
        let fields = parse_args(call.arg_bytes())?;
        match call.method.as_str() {
            "stat" => {
                let size = lock(&self.content).len() as u64;
                reply_fields(|e| {
                    e.entry("name", |e| e.str(&self.name))?;
                    e.entry("size", |e| e.u64(size))?;
                    e.entry("writable", |e| e.bool(self.writable))
                })
            }
            "readBytes" => {
                let content = lock(&self.content);
                let len = content.len() as u64;
                let end = fields.u64("end").map_err(bad_args)?.unwrap_or(len).min(len);
                let start = fields.u64("start").map_err(bad_args)?.unwrap_or(0).min(end);
                Ok(Some(Envelope::bytes(&content[start as usize..end as usize])))
            }
            "readTxt" => {
                let content = lock(&self.content);
                if std::str::from_utf8(&content).is_err() {
                    return Err(FailureReason::Handler(format!("file '{}' is not utf-8", self.name)));
                }
                Ok(Some(Envelope::bytes(content.clone())))
            }
            "writeBytes" => {
                self.check_writable()?;
                let bytes = required(fields.bytes("bytes").map_err(bad_args)?, "bytes")?;
                *lock(&self.content) = bytes.to_vec();
                Ok(None)
            }
            "writeTxt" => {
                self.check_writable()?;
                let text = required(fields.str("text").map_err(bad_args)?, "text")?;
                *lock(&self.content) = text.as_bytes().to_vec();
                Ok(None)
            }
            "getByteSink" => {
                self.check_writable()?;
                if fields.bool("truncate").map_err(bad_args)?.unwrap_or(false) {
                    lock(&self.content).clear();
                }
                let sink: Cap = Arc::new(MemByteSink::over(self.content.clone()));
                Ok(Some(Envelope::caps(vec![sink])))
            }
            "getByteSource" => {
                let snapshot = Arc::new(Mutex::new(self.contents()));
                let source: Cap = Arc::new(MemByteSource::over(snapshot));
                Ok(Some(Envelope::caps(vec![source])))
            }
            other => Err(unknown_method(ObjectKind::File, other)),
        }
    }
}

#[async_trait::async_trait]
impl CapObject for MemFile {
    fn kind(&self) -> ObjectKind {
        ObjectKind::File
    }

    async fn invoke(&self, call: ServedCall) {
        let result = self.serve(&call);
        call.responder.settle(result);
    }
}
