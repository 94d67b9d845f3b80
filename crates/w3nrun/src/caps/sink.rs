//! Byte sinks: write-only handles into a file.
//!
//! | method    | arguments                  | reply      |
//! |-----------|----------------------------|------------|
//! | `getSize` |                            | `{ size }` |
//! | `splice`  | `{ pos, del?, bytes? }`    |            |
//! | `truncate`| `{ size }`                 |            |
//! | `done`    | `{ err? }`                 |            |
//!
//! After `done` the sink refuses everything, including a second `done`.

use std::sync::Arc;
use std::sync::Mutex;

use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::bridge::SinkBridge;
use crate::call::CallResult;
use crate::capability::Cap;
use crate::capability::CapObject;
use crate::capability::ServedCall;
use crate::capability::call_object;
use crate::caps::Fields;
use crate::caps::args;
use crate::caps::bad_args;
use crate::caps::expect_kind;
use crate::caps::lock;
use crate::caps::parse_args;
use crate::caps::reply_bytes;
use crate::caps::reply_fields;
use crate::caps::required;
use crate::caps::unknown_method;
use crate::error::Result;

/// Typed access to a `FileByteSink`.
#[derive(Clone)]
pub struct ByteSinkView {
    object: Cap,
}

impl ByteSinkView {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::FileByteSink)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    pub async fn get_size(&self) -> Result<u64> {
        let reply = reply_bytes(call_object(&self.object, "getSize", None).await?)?;
        let size = Fields::parse(&reply)?.u64("size")?;
        Ok(size.unwrap_or(0))
    }

    /// Replaces `del` bytes at `pos` with `bytes`.
    pub async fn splice(&self, pos: u64, del: u64, bytes: &[u8]) -> Result<()> {
        let args = args(|e| {
            e.entry("pos", |e| e.u64(pos))?;
            e.entry("del", |e| e.u64(del))?;
            e.entry("bytes", |e| e.bytes(bytes))
        })?;
        call_object(&self.object, "splice", args).await?;
        Ok(())
    }

    /// Overwrites at `pos`, growing the sink as needed.
    pub async fn write_at(&self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.splice(pos, bytes.len() as u64, bytes).await
    }

    pub async fn truncate(&self, size: u64) -> Result<()> {
        let args = args(|e| e.entry("size", |e| e.u64(size)))?;
        call_object(&self.object, "truncate", args).await?;
        Ok(())
    }

    /// Finalizes the sink, optionally reporting why the writer gave up.
    pub async fn done(&self, err: Option<&str>) -> Result<()> {
        let args = args(|e| match err {
            Some(msg) => e.entry("err", |e| e.str(msg)),
            None => Ok(()),
        })?;
        call_object(&self.object, "done", args).await?;
        Ok(())
    }

    /// A bridge that writes pushed chunks into this sink.
    pub fn bridge(self) -> SinkBridge {
        SinkBridge::new(self)
    }
}

#[derive(Debug, Default)]
struct SinkState {
    finished: Option<Option<String>>,
    done_calls: usize,
}

/// A sink writing into shared memory, usually a `MemFile`'s content.
pub struct MemByteSink {
    content: Arc<Mutex<Vec<u8>>>,
    state: Mutex<SinkState>,
}

impl MemByteSink {
    pub fn new() -> Self {
        Self::over(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn over(content: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { content, state: Mutex::new(SinkState::default()) }
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.content).clone()
    }

    pub fn is_done(&self) -> bool {
        lock(&self.state).finished.is_some()
    }

    /// The error the writer finalized with, if any.
    pub fn done_error(&self) -> Option<String> {
        lock(&self.state).finished.clone().flatten()
    }

    /// How many times `done` was requested, accepted or not.
    pub fn done_calls(&self) -> usize {
        lock(&self.state).done_calls
    }

    fn check_open(&self) -> std::result::Result<(), FailureReason> {
        if lock(&self.state).finished.is_some() {
            return Err(FailureReason::Handler("sink is already done".into()));
        }
        Ok(())
    }

    fn serve(&self, call: &ServedCall) -> CallResult {
        let fields = parse_args(call.arg_bytes())?;
        match call.method.as_str() {
            "getSize" => {
                let size = lock(&self.content).len() as u64;
                reply_fields(|e| e.entry("size", |e| e.u64(size)))
            }
            "splice" => {
                self.check_open()?;
                let pos = required(fields.u64("pos").map_err(bad_args)?, "pos")?;
                let del = fields.u64("del").map_err(bad_args)?.unwrap_or(0);
                let bytes = fields.bytes("bytes").map_err(bad_args)?.unwrap_or_default();

                let mut content = lock(&self.content);
                let len = content.len() as u64;
                if pos > len {
                    return Err(FailureReason::Handler(format!(
                        "splice at {} is past the end ({})", pos, len,
                    )));
                }
                // Both bounds are within `len`, so they fit a usize.
                let end = pos.saturating_add(del).min(len);
                let range = pos as usize..end as usize;
                let _removed: Vec<u8> = content.splice(range, bytes.iter().copied()).collect();
                Ok(None)
            }
            "truncate" => {
                self.check_open()?;
                let size = required(fields.u64("size").map_err(bad_args)?, "size")? as usize;
                lock(&self.content).truncate(size);
                Ok(None)
            }
            "done" => {
                let err = fields.str("err").map_err(bad_args)?.map(str::to_string);
                let mut state = lock(&self.state);
                state.done_calls += 1;
                if state.finished.is_some() {
                    return Err(FailureReason::Handler("sink is already done".into()));
                }
                if let Some(msg) = &err {
                    tracing::debug!(error = %msg, "sink finalized with an error");
                }
                state.finished = Some(err);
                Ok(None)
            }
            other => Err(unknown_method(ObjectKind::FileByteSink, other)),
        }
    }
}

impl Default for MemByteSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CapObject for MemByteSink {
    fn kind(&self) -> ObjectKind {
        ObjectKind::FileByteSink
    }

    async fn invoke(&self, call: ServedCall) {
        let result = self.serve(&call);
        call.responder.settle(result);
    }
}
