//! Filesystems: a flat namespace of files.
//!
//! | method              | arguments              | reply           |
//! |---------------------|------------------------|-----------------|
//! | `readBytes`         | `{ path }`             | the bytes       |
//! | `readTxt`           | `{ path }`             | utf-8 bytes     |
//! | `writeBytes`        | `{ path, bytes }`      |                 |
//! | `writeTxt`          | `{ path, text }`       |                 |
//! | `getFile`           | `{ path, create? }`    | a `File`        |
//! | `listFolder`        | `{ path? }`            | `{ names }`     |
//! | `checkFilePresence` | `{ path }`             | `{ present }`   |
//! | `deleteFile`        | `{ path }`             |                 |
//!
//! `getFile` hands out the same object for a path every time, so a file
//! passed back and forth keeps its identity.

use std::collections::BTreeMap;
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
use crate::caps::file::FileView;
use crate::caps::file::MemFile;
use crate::caps::lock;
use crate::caps::parse_args;
use crate::caps::reply_bytes;
use crate::caps::reply_cap;
use crate::caps::reply_fields;
use crate::caps::required;
use crate::caps::unknown_method;
use crate::error::Error;
use crate::error::Result;

/// Typed access to an `FsImpl`.
#[derive(Clone)]
pub struct FsView {
    object: Cap,
}

impl FsView {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::FsImpl)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let args = args(|e| e.entry("path", |e| e.str(path)))?;
        reply_bytes(call_object(&self.object, "readBytes", args).await?)
    }

    pub async fn read_txt(&self, path: &str) -> Result<String> {
        let args = args(|e| e.entry("path", |e| e.str(path)))?;
        let bytes = reply_bytes(call_object(&self.object, "readTxt", args).await?)?;
        String::from_utf8(bytes).map_err(|_| Error::Pack(w3npack::Error::InvalidUtf8))
    }

    pub async fn write_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let args = args(|e| {
            e.entry("path", |e| e.str(path))?;
            e.entry("bytes", |e| e.bytes(bytes))
        })?;
        call_object(&self.object, "writeBytes", args).await?;
        Ok(())
    }

    pub async fn write_txt(&self, path: &str, text: &str) -> Result<()> {
        let args = args(|e| {
            e.entry("path", |e| e.str(path))?;
            e.entry("text", |e| e.str(text))
        })?;
        call_object(&self.object, "writeTxt", args).await?;
        Ok(())
    }

    /// Opens `path`, creating an empty file first if `create` is set.
    pub async fn get_file(&self, path: &str, create: bool) -> Result<FileView> {
        let args = args(|e| {
            e.entry("path", |e| e.str(path))?;
            e.entry("create", |e| e.bool(create))
        })?;
        let reply = call_object(&self.object, "getFile", args).await?;
        FileView::new(reply_cap(reply, ObjectKind::File)?)
    }

    /// Names under `prefix`, or every name.
    pub async fn list_folder(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let args = args(|e| match prefix {
            Some(prefix) => e.entry("path", |e| e.str(prefix)),
            None => Ok(()),
        })?;
        let reply = reply_bytes(call_object(&self.object, "listFolder", args).await?)?;
        let fields = Fields::parse(&reply)?;
        let Some(mut names) = fields.list("names")? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        while let Some(mut name) = names.next()? {
            out.push(name.str()?.to_string());
        }
        Ok(out)
    }

    pub async fn check_file_presence(&self, path: &str) -> Result<bool> {
        let args = args(|e| e.entry("path", |e| e.str(path)))?;
        let reply = reply_bytes(call_object(&self.object, "checkFilePresence", args).await?)?;
        Ok(Fields::parse(&reply)?.bool("present")?.unwrap_or(false))
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let args = args(|e| e.entry("path", |e| e.str(path)))?;
        call_object(&self.object, "deleteFile", args).await?;
        Ok(())
    }
}

/// A filesystem held in memory.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<MemFile>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file, builder style.
    pub fn with_file(self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let path = path.into();
        lock(&self.files).insert(path.clone(), Arc::new(MemFile::new(path, content)));
        self
    }

    /// The object `getFile` hands out for `path`.
    pub fn file(&self, path: &str) -> Option<Arc<MemFile>> {
        lock(&self.files).get(path).cloned()
    }

    fn existing(&self, path: &str) -> std::result::Result<Arc<MemFile>, FailureReason> {
        self.file(path)
            .ok_or_else(|| FailureReason::Handler(format!("no such file '{}'", path)))
    }

    fn serve(&self, call: &ServedCall) -> CallResult {
        let fields = parse_args(call.arg_bytes())?;
        let path = fields.str("path").map_err(bad_args)?;
        match call.method.as_str() {
            "readBytes" => {
                let file = self.existing(required(path, "path")?)?;
                Ok(Some(Envelope::bytes(file.contents())))
            }
            "readTxt" => {
                let path = required(path, "path")?;
                let content = self.existing(path)?.contents();
                if std::str::from_utf8(&content).is_err() {
                    return Err(FailureReason::Handler(format!("file '{}' is not utf-8", path)));
                }
                Ok(Some(Envelope::bytes(content)))
            }
            "writeBytes" => {
                let path = required(path, "path")?;
                let bytes = required(fields.bytes("bytes").map_err(bad_args)?, "bytes")?;
                self.write(path, bytes.to_vec());
                Ok(None)
            }
            "writeTxt" => {
                let path = required(path, "path")?;
                let text = required(fields.str("text").map_err(bad_args)?, "text")?;
                self.write(path, text.as_bytes().to_vec());
                Ok(None)
            }
            "getFile" => {
                let path = required(path, "path")?;
                let create = fields.bool("create").map_err(bad_args)?.unwrap_or(false);
                let file = {
                    let mut files = lock(&self.files);
                    match files.get(path) {
                        Some(file) => file.clone(),
                        None if create => {
                            let file = Arc::new(MemFile::new(path, Vec::new()));
                            files.insert(path.to_string(), file.clone());
                            file
                        }
                        None => return Err(FailureReason::Handler(format!("no such file '{}'", path))),
                    }
                };
                let file: Cap = file;
                Ok(Some(Envelope::caps(vec![file])))
            }
            "listFolder" => {
                let prefix = path.unwrap_or("");
                let names: Vec<String> = lock(&self.files)
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect();
                reply_fields(|e| {
                    e.entry("names", |e| {
                        e.list_begin()?;
                        for name in &names {
                            e.str(name)?;
                        }
                        e.list_end()
                    })
                })
            }
            "checkFilePresence" => {
                let present = lock(&self.files).contains_key(required(path, "path")?);
                reply_fields(|e| e.entry("present", |e| e.bool(present)))
            }
            "deleteFile" => {
                let path = required(path, "path")?;
                if lock(&self.files).remove(path).is_none() {
                    return Err(FailureReason::Handler(format!("no such file '{}'", path)));
                }
                Ok(None)
            }
            other => Err(unknown_method(ObjectKind::FsImpl, other)),
        }
    }

    /// Writes through an existing file so handed-out objects see the change.
    fn write(&self, path: &str, bytes: Vec<u8>) {
        let mut files = lock(&self.files);
        match files.get(path) {
            Some(file) => file.replace(bytes),
            None => {
                files.insert(path.to_string(), Arc::new(MemFile::new(path, bytes)));
            }
        }
    }
}

#[async_trait::async_trait]
impl CapObject for MemFs {
    fn kind(&self) -> ObjectKind {
        ObjectKind::FsImpl
    }

    async fn invoke(&self, call: ServedCall) {
        let result = self.serve(&call);
        call.responder.settle(result);
    }
}
