//! Connections as capabilities.
//!
//! A connection can itself be handed to a peer, which then drives it as if
//! it held the link directly. Calls hop through every link in between; the
//! objects they carry are re-exported on each hop.
//!
//! `RpcConnection` forwards every method to the wrapped connection's root
//! service, except `$close`. `IncomingConnection` offers:
//!
//! | method  | arguments                                        | outcomes                      |
//! |---------|--------------------------------------------------|-------------------------------|
//! | `watch` |                                                  | one interim per message       |
//! | `send`  | `{ callNum, status, hasData, bytes?, hasCaps, err? }` |                          |
//! | `close` |                                                  |                               |

use w3npack::Encoder;
use w3nrpc::CallStatus;
use w3nrpc::FailureReason;
use w3nrpc::ObjectKind;

use crate::call::CallEvent;
use crate::call::CallResult;
use crate::call::ObservableCall;
use crate::capability::Cap;
use crate::capability::CapObject;
use crate::capability::Envelope;
use crate::capability::ServedCall;
use crate::capability::call_object;
use crate::capability::observe_object;
use crate::capability::relay;
use crate::caps::Fields;
use crate::caps::bad_args;
use crate::caps::encode_fields;
use crate::caps::expect_kind;
use crate::caps::parse_args;
use crate::caps::required;
use crate::caps::unknown_method;
use crate::connection::Connection;
use crate::error::Error;
use crate::error::Result;
use crate::incoming::IncomingConnection;
use crate::incoming::IncomingMsg;
use crate::incoming::OutgoingMsg;

pub const CLOSE_METHOD: &str = "$close";

/// Writes the bytes half of `data` as fields and hands back its objects.
fn encode_data(e: &mut Encoder, data: Option<Envelope>) -> w3npack::Result<Option<Vec<Cap>>> {
    let Some(data) = data else {
        e.entry("hasData", |e| e.bool(false))?;
        return Ok(None);
    };
    e.entry("hasData", |e| e.bool(true))?;
    if let Some(bytes) = &data.bytes {
        e.entry("bytes", |e| e.bytes(bytes))?;
    }
    e.entry("hasCaps", |e| e.bool(data.caps.is_some()))?;
    Ok(data.caps)
}

fn decode_data(fields: &Fields<'_>, caps: Option<Vec<Cap>>) -> w3npack::Result<Option<Envelope>> {
    if !fields.bool("hasData")?.unwrap_or(false) {
        return Ok(None);
    }
    let bytes = fields.bytes("bytes")?.map(<[u8]>::to_vec);
    let caps = match fields.bool("hasCaps")?.unwrap_or(false) {
        true => Some(caps.unwrap_or_default()),
        false => None,
    };
    Ok(Some(Envelope { bytes, caps }))
}

fn pack_error(e: w3nrpc::Error) -> w3npack::Error {
    match e {
        w3nrpc::Error::Serialization(e) => e,
        _ => w3npack::Error::InvalidMapEntry,
    }
}

fn into_envelope(bytes: Vec<u8>, caps: Option<Vec<Cap>>) -> Envelope {
    Envelope { bytes: Some(bytes), caps }
}

/// A client connection, served as an `RpcConnection`.
pub struct ConnectionCap {
    conn: Connection,
}

impl ConnectionCap {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

#[async_trait::async_trait]
impl CapObject for ConnectionCap {
    fn kind(&self) -> ObjectKind {
        ObjectKind::RpcConnection
    }

    async fn invoke(&self, call: ServedCall) {
        if call.method == CLOSE_METHOD {
            self.conn.close().await;
            call.responder.end(None);
            return;
        }
        let events = self.conn.observe(&call.method, call.args);
        relay(events, call.responder).await;
    }
}

/// Typed access to an `RpcConnection`, local or held by a peer.
#[derive(Clone)]
pub struct RemoteConnection {
    object: Cap,
}

impl RemoteConnection {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::RpcConnection)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    pub async fn call(&self, method: &str, args: Option<Envelope>) -> CallResult {
        call_object(&self.object, method, args).await
    }

    pub fn observe(&self, method: &str, args: Option<Envelope>) -> ObservableCall {
        observe_object(&self.object, method, args)
    }

    pub async fn close(&self) -> Result<()> {
        call_object(&self.object, CLOSE_METHOD, None).await?;
        Ok(())
    }
}

/// An incoming connection, served as an `IncomingConnection`.
pub struct IncomingCap {
    incoming: IncomingConnection,
}

impl IncomingCap {
    pub fn new(incoming: IncomingConnection) -> Self {
        Self { incoming }
    }

    async fn watch(&self, call: ServedCall) {
        let mut stream = match self.incoming.watch() {
            Ok(stream) => stream,
            Err(exc) => {
                call.responder.fail(FailureReason::Rpc(exc.with_method("watch")));
                return;
            }
        };

        loop {
            let msg = tokio::select! {
                msg = stream.next() => msg,
                _ = call.responder.cancelled() => return,
            };
            let Some(msg) = msg else {
                call.responder.end(None);
                return;
            };

            let mut caps = None;
            let encoded = encode_fields(|e| match msg {
                IncomingMsg::Start(start) => {
                    e.entry("type", |e| e.str("start"))?;
                    e.entry("callNum", |e| e.u64(start.call_num))?;
                    e.entry("method", |e| e.str(&start.method))?;
                    caps = encode_data(e, start.data)?;
                    Ok(())
                }
                IncomingMsg::Cancel { call_num } => {
                    e.entry("type", |e| e.str("cancel"))?;
                    e.entry("callNum", |e| e.u64(call_num))
                }
            });
            match encoded {
                Ok(bytes) => {
                    call.responder.interim(Some(into_envelope(bytes, caps)));
                }
                Err(e) => {
                    call.responder.fail(FailureReason::Handler(format!("message failed to encode: {}", e)));
                    return;
                }
            }
        }
    }

    fn send(&self, call: &ServedCall) -> CallResult {
        let fields = parse_args(call.arg_bytes())?;
        let call_num = required(fields.u64("callNum").map_err(bad_args)?, "callNum")?;
        let status = required(fields.str("status").map_err(bad_args)?, "status")?;
        let status = CallStatus::from_tag(status)
            .map_err(|e| FailureReason::ProtocolViolation(e.to_string()))?;
        let caps = call.args.as_ref().and_then(|a| a.caps.clone());
        let data = decode_data(&fields, caps).map_err(bad_args)?;
        let err = fields.get("err")
            .map(|mut d| FailureReason::decode(&mut d))
            .transpose()
            .map_err(|e| FailureReason::ProtocolViolation(e.to_string()))?;

        self.incoming.send(OutgoingMsg { call_num, status, data, err })
            .map_err(|exc| FailureReason::Rpc(exc.with_method("send")))?;
        Ok(None)
    }
}

#[async_trait::async_trait]
impl CapObject for IncomingCap {
    fn kind(&self) -> ObjectKind {
        ObjectKind::IncomingConnection
    }

    async fn invoke(&self, call: ServedCall) {
        match call.method.as_str() {
            "watch" => self.watch(call).await,
            "send" => {
                let result = self.send(&call);
                call.responder.settle(result);
            }
            "close" => {
                self.incoming.close().await;
                call.responder.end(None);
            }
            other => {
                call.responder.fail(unknown_method(ObjectKind::IncomingConnection, other));
            }
        }
    }
}

/// A message seen through a `RemoteIncoming`.
#[derive(Debug)]
pub enum RemoteIncomingMsg {
    Start { call_num: u64, method: String, data: Option<Envelope> },
    Cancel { call_num: u64 },
}

/// Typed access to an `IncomingConnection`, local or held by a peer.
#[derive(Clone)]
pub struct RemoteIncoming {
    object: Cap,
}

impl RemoteIncoming {
    pub fn new(object: Cap) -> Result<Self> {
        expect_kind(&object, ObjectKind::IncomingConnection)?;
        Ok(Self { object })
    }

    pub fn object(&self) -> &Cap {
        &self.object
    }

    pub fn watch(&self) -> RemoteIncomingStream {
        RemoteIncomingStream { events: observe_object(&self.object, "watch", None) }
    }

    pub async fn send(&self, msg: OutgoingMsg) -> Result<()> {
        let OutgoingMsg { call_num, status, data, err } = msg;
        let mut caps = None;
        let bytes = encode_fields(|e| {
            e.entry("callNum", |e| e.u64(call_num))?;
            e.entry("status", |e| e.str(status.as_tag()))?;
            caps = encode_data(e, data)?;
            if let Some(err) = &err {
                e.entry("err", |e| err.encode(e).map_err(pack_error))?;
            }
            Ok(())
        })?;
        call_object(&self.object, "send", Some(into_envelope(bytes, caps))).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        call_object(&self.object, "close", None).await?;
        Ok(())
    }
}

/// The messages of a watched `RemoteIncoming`.
pub struct RemoteIncomingStream {
    events: ObservableCall,
}

impl RemoteIncomingStream {
    /// `None` once the connection is closed or the watch ended.
    pub async fn next(&mut self) -> Option<Result<RemoteIncomingMsg>> {
        match self.events.next().await? {
            CallEvent::Next(Some(data)) => Some(decode_msg(data)),
            CallEvent::Next(None) => Some(Err(Error::MissingReply("message"))),
            CallEvent::Complete(_) => None,
            CallEvent::Error(reason) => Some(Err(Error::Remote(reason))),
        }
    }

    pub fn cancel(&self) {
        self.events.cancel();
    }
}

fn decode_msg(data: Envelope) -> Result<RemoteIncomingMsg> {
    let Envelope { bytes, caps } = data;
    let bytes = bytes.ok_or(Error::MissingReply("message"))?;
    let fields = Fields::parse(&bytes)?;
    let call_num = fields.u64("callNum")?.ok_or(Error::MissingReply("callNum"))?;
    match fields.str("type")? {
        Some("start") => Ok(RemoteIncomingMsg::Start {
            call_num,
            method: fields.str("method")?.unwrap_or_default().to_string(),
            data: decode_data(&fields, caps)?,
        }),
        Some("cancel") => Ok(RemoteIncomingMsg::Cancel { call_num }),
        Some(other) => Err(Error::Protocol(w3nrpc::Error::UnknownVariant(other.to_string()))),
        None => Err(Error::MissingReply("type")),
    }
}
