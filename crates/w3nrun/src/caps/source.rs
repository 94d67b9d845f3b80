//! Byte sources: sequential readers over a file.
//!
//! | method        | arguments    | reply                               |
//! |---------------|--------------|-------------------------------------|
//! | `read`        | `{ len? }`   | the bytes, or no data at the end    |
//! | `stream`      | `{ chunk? }` | interim chunks, then `end`          |
//! | `getSize`     |              | `{ size }`                          |
//! | `getPosition` |              | `{ pos }`                           |
//! | `seek`        | `{ offset }` |                                     |
//!
//! `stream` stops at the next chunk boundary once the caller cancels.

use std::sync::Arc;
use std::sync::Mutex;

use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::call::CallResult;
use crate::call::ObservableCall;
use crate::capability::Cap;
use crate::capability::CapObject;
use crate::capability::Envelope;
use crate::capability::ServedCall;
use crate::capability::call_object;
use crate::capability::observe_object;
use crate::caps::Fields;
use crate::caps::args;
use crate::caps::bad_args;
use crate::caps::expect_kind;
use crate::caps::lock;
use crate::caps::parse_args;
use crate::caps::reply_bytes;
use crate::caps::reply_fields;
use crate::caps::required;
use crate::caps::sink::ByteSinkView;
use crate::caps::unknown_method;
use crate::error::Result;

pub const DEFAULT_CHUNK: u64 = 64 * 1024;

/// Typed access to a `FileByteSource`.
#[derive(Clone)]
pub struct ByteSourceView {
    object: Cap,
}

impl ByteSourceView {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::FileByteSource)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    /// Reads up to `len` bytes. `None` at the end of the source.
    pub async fn read(&self, len: u64) -> Result<Option<Vec<u8>>> {
        let args = args(|e| e.entry("len", |e| e.u64(len)))?;
        let reply = call_object(&self.object, "read", args).await?;
        Ok(reply.and_then(|r| r.bytes))
    }

    /// Reads everything from the current position on.
    pub async fn read_all(&self) -> Result<Vec<u8>> {
        let mut all = Vec::new();
        while let Some(chunk) = self.read(DEFAULT_CHUNK).await? {
            all.extend_from_slice(&chunk);
        }
        Ok(all)
    }

    /// Streams the rest of the source in chunks of at most `chunk` bytes.
    pub fn stream(&self, chunk: u64) -> Result<ObservableCall> {
        let args = args(|e| e.entry("chunk", |e| e.u64(chunk)))?;
        Ok(observe_object(&self.object, "stream", args))
    }

    pub async fn get_size(&self) -> Result<u64> {
        let reply = reply_bytes(call_object(&self.object, "getSize", None).await?)?;
        Ok(Fields::parse(&reply)?.u64("size")?.unwrap_or(0))
    }

    pub async fn get_position(&self) -> Result<u64> {
        let reply = reply_bytes(call_object(&self.object, "getPosition", None).await?)?;
        Ok(Fields::parse(&reply)?.u64("pos")?.unwrap_or(0))
    }

    pub async fn seek(&self, offset: u64) -> Result<()> {
        let args = args(|e| e.entry("offset", |e| e.u64(offset)))?;
        call_object(&self.object, "seek", args).await?;
        Ok(())
    }

    /// Copies the rest of this source into `sink`, one chunk in flight at a
    /// time, and finalizes the sink. Returns the number of bytes copied.
    pub async fn pipe_to(&self, sink: ByteSinkView, chunk: u64) -> Result<u64> {
        let bridge = sink.bridge();
        loop {
            match self.read(chunk).await {
                Ok(Some(bytes)) => bridge.push(Some(bytes), None).await?,
                Ok(None) => {
                    bridge.push(None, None).await?;
                    break;
                }
                Err(e) => {
                    let reason = e.into_failure();
                    let _ = bridge.push(None, Some(reason.clone())).await;
                    let _ = bridge.finish().await;
                    return Err(reason.into());
                }
            }
        }
        Ok(bridge.finish().await?)
    }
}

/// A source reading a snapshot of shared memory.
pub struct MemByteSource {
    content: Arc<Mutex<Vec<u8>>>,
    pos: Mutex<u64>,
}

impl MemByteSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self::over(Arc::new(Mutex::new(bytes.into())))
    }

    pub(crate) fn over(content: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { content, pos: Mutex::new(0) }
    }

    /// Takes the next chunk and advances. `None` at the end.
    fn take(&self, len: u64) -> Option<Vec<u8>> {
        let content = lock(&self.content);
        let mut pos = lock(&self.pos);
        let start = (*pos as usize).min(content.len());
        let end = start.saturating_add(len as usize).min(content.len());
        if start == end {
            return None;
        }
        *pos = end as u64;
        Some(content[start..end].to_vec())
    }

    fn serve(&self, call: &ServedCall) -> CallResult {
        let fields = parse_args(call.arg_bytes())?;
        match call.method.as_str() {
            "read" => {
                let len = fields.u64("len").map_err(bad_args)?.unwrap_or(DEFAULT_CHUNK);
                Ok(self.take(len).map(Envelope::bytes))
            }
            "getSize" => {
                let size = lock(&self.content).len() as u64;
                reply_fields(|e| e.entry("size", |e| e.u64(size)))
            }
            "getPosition" => {
                let pos = *lock(&self.pos);
                reply_fields(|e| e.entry("pos", |e| e.u64(pos)))
            }
            "seek" => {
                let offset = required(fields.u64("offset").map_err(bad_args)?, "offset")?;
                let size = lock(&self.content).len() as u64;
                if offset > size {
                    return Err(FailureReason::Handler(format!("seek to {} is past the end ({})", offset, size)));
                }
                *lock(&self.pos) = offset;
                Ok(None)
            }
            other => Err(unknown_method(ObjectKind::FileByteSource, other)),
        }
    }

    async fn stream(&self, call: ServedCall) {
        let chunk = match Fields::of(call.arg_bytes()).and_then(|f| f.u64("chunk")) {
            Ok(chunk) => chunk.unwrap_or(DEFAULT_CHUNK).max(1),
            Err(e) => {
                call.responder.fail(bad_args(e));
                return;
            }
        };

        while let Some(bytes) = self.take(chunk) {
            if call.responder.is_cancelled() {
                tracing::trace!("byte stream cancelled");
                return;
            }
            call.responder.interim(Some(Envelope::bytes(bytes)));
            tokio::task::yield_now().await;
        }
        call.responder.end(None);
    }
}

#[async_trait::async_trait]
impl CapObject for MemByteSource {
    fn kind(&self) -> ObjectKind {
        ObjectKind::FileByteSource
    }

    async fn invoke(&self, call: ServedCall) {
        if call.method == "stream" {
            return self.stream(call).await;
        }
        let result = self.serve(&call);
        call.responder.settle(result);
    }
}
