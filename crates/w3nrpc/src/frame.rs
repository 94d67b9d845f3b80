//! # Protocol Frames
//!
//! One transport message carries exactly one `Frame`:
//!
//! - `Start`: open call `call_num`, addressed either to the connection's root
//!   service (`path: None`) or to an object the receiver registered.
//! - `Cancel`: the caller lost interest in `call_num`.
//! - `Outcome`: `interim`, `end` or `error` for one of the receiver's calls.
//! - `Close`: orderly shutdown of the link.
//!
//! Both sides issue calls, so `call_num` is scoped to the direction. A
//! `Start`/`Cancel` names the sender's call, an `Outcome` names the receiver's.
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result` on any input.
//! - **Forward Compatibility**: unknown map keys are skipped.

use w3npack::Decoder;
use w3npack::Encoder;

use crate::datum::Datum;
use crate::datum::ObjectPath;
use crate::datum::decode_opt_datum;
use crate::datum::decode_path;
use crate::datum::encode_opt_datum;
use crate::datum::encode_path;
use crate::error::Error;
use crate::error::FailureReason;
use crate::error::Result;
use crate::exception::RpcException;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Interim,
    End,
    Error,
}

impl CallStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Interim => "interim",
            Self::End => "end",
            Self::Error => "error",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "interim" => Ok(Self::Interim),
            "end" => Ok(Self::End),
            "error" => Ok(Self::Error),
            other => Err(Error::UnknownVariant(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Interim)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStart {
    pub call_num: u64,
    pub path: Option<ObjectPath>,
    pub method: String,
    pub data: Option<Datum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCancel {
    pub call_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub call_num: u64,
    pub status: CallStatus,
    pub data: Option<Datum>,
    pub err: Option<FailureReason>,
}

impl CallOutcome {
    pub fn interim(call_num: u64, data: Option<Datum>) -> Self {
        Self { call_num, status: CallStatus::Interim, data, err: None }
    }

    pub fn end(call_num: u64, data: Option<Datum>) -> Self {
        Self { call_num, status: CallStatus::End, data, err: None }
    }

    pub fn error(call_num: u64, err: FailureReason) -> Self {
        Self { call_num, status: CallStatus::Error, data: None, err: Some(err) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start(CallStart),
    Cancel(CallCancel),
    Outcome(CallOutcome),
    Close,
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut Decoder::new(bytes))
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Frame::Start(start) => {
                enc.variant_begin("start")?;
                enc.map_begin()?;
                enc.entry("callNum", |e| e.u64(start.call_num))?;
                if let Some(path) = &start.path {
                    enc.entry("path", |e| encode_path(e, path))?;
                }
                enc.entry("method", |e| e.str(&start.method))?;
                enc.variant_begin("data")?;
                encode_opt_datum(enc, start.data.as_ref())?;
                enc.variant_end()?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Cancel(cancel) => {
                enc.variant_begin("cancel")?;
                enc.map_begin()?;
                enc.entry("callNum", |e| e.u64(cancel.call_num))?;
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Outcome(outcome) => {
                enc.variant_begin("outcome")?;
                enc.map_begin()?;
                enc.entry("callNum", |e| e.u64(outcome.call_num))?;
                enc.entry("callStatus", |e| e.str(outcome.status.as_tag()))?;
                enc.variant_begin("data")?;
                encode_opt_datum(enc, outcome.data.as_ref())?;
                enc.variant_end()?;
                if let Some(err) = &outcome.err {
                    enc.variant_begin("err")?;
                    err.encode(enc)?;
                    enc.variant_end()?;
                }
                enc.map_end()?;
                enc.variant_end()?;
            }
            Frame::Close => {
                enc.variant_begin("close")?;
                enc.unit()?;
                enc.variant_end()?;
            }
        }
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let (msg_type, mut body) = dec.variant()?;
        match msg_type {
            "start" => decode_start(&mut body).map(Frame::Start),
            "cancel" => {
                let mut map = body.map()?;
                let mut call_num = None;
                while let Some((key, mut val)) = map.next()? {
                    match key {
                        "callNum" => call_num = Some(val.u64()?),
                        _ => val.skip()?,
                    }
                }
                let call_num = call_num.ok_or(Error::MissingField("callNum"))?;
                Ok(Frame::Cancel(CallCancel { call_num }))
            }
            "outcome" => decode_outcome(&mut body).map(Frame::Outcome),
            "close" => {
                body.unit()?;
                Ok(Frame::Close)
            }
            other => Err(Error::UnknownVariant(format!("top-level frame: {}", other))),
        }
    }
}

fn decode_start(body: &mut Decoder<'_>) -> Result<CallStart> {
    let mut map = body.map()?;
    let mut call_num = None;
    let mut path = None;
    let mut method = None;
    let mut data = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "callNum" => call_num = Some(val.u64()?),
            "path" => path = Some(decode_path(&mut val)?),
            "method" => method = Some(val.str()?.to_string()),
            "data" => data = decode_opt_datum(&mut val)?,
            _ => val.skip()?,
        }
    }

    Ok(CallStart {
        call_num: call_num.ok_or(Error::MissingField("callNum"))?,
        path,
        method: method.ok_or(Error::MissingField("method"))?,
        data,
    })
}

fn decode_outcome(body: &mut Decoder<'_>) -> Result<CallOutcome> {
    let mut map = body.map()?;
    let mut call_num = None;
    let mut status = None;
    let mut data = None;
    let mut err = None;

    while let Some((key, mut val)) = map.next()? {
        match key {
            "callNum" => call_num = Some(val.u64()?),
            "callStatus" => status = Some(CallStatus::from_tag(val.str()?)?),
            "data" => data = decode_opt_datum(&mut val)?,
            "err" => err = Some(FailureReason::decode(&mut val)?),
            _ => val.skip()?,
        }
    }

    let status = status.ok_or(Error::MissingField("callStatus"))?;
    if status == CallStatus::Error && err.is_none() {
        return Err(Error::MissingField("err"));
    }

    Ok(CallOutcome {
        call_num: call_num.ok_or(Error::MissingField("callNum"))?,
        status,
        data,
        err,
    })
}

impl FailureReason {
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(self.as_tag())?;
        match self {
            Self::Rpc(exc) => exc.encode(enc)?,
            Self::Handler(msg)
            | Self::MethodNotFound(msg)
            | Self::ProtocolViolation(msg) => enc.str(msg)?,
        }
        enc.variant_end()?;
        Ok(())
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let (tag, mut body) = dec.variant()?;
        match tag {
            "Rpc" => Ok(Self::Rpc(RpcException::decode(&mut body)?)),
            "Handler" => Ok(Self::Handler(body.str()?.to_string())),
            "NoMethod" => Ok(Self::MethodNotFound(body.str()?.to_string())),
            "Protocol" => Ok(Self::ProtocolViolation(body.str()?.to_string())),
            other => Err(Error::UnknownVariant(other.to_string())),
        }
    }
}

/// Which frame a raw message holds and the call it names, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Start(u64),
    Cancel(u64),
    Outcome(u64),
    Close,
}

/// Reads just the frame type and call number.
///
/// Used to answer or fail the right call when the rest of the frame does not
/// decode, e.g. a reference of a kind this side does not know.
pub fn peek_header(bytes: &[u8]) -> Result<FrameHeader> {
    let mut dec = Decoder::new(bytes);
    let (msg_type, mut body) = dec.variant()?;
    if msg_type == "close" {
        return Ok(FrameHeader::Close);
    }

    let mut map = body.map()?;
    while let Some((key, mut val)) = map.next()? {
        if key != "callNum" {
            val.skip()?;
            continue;
        }
        let call_num = val.u64()?;
        return match msg_type {
            "start" => Ok(FrameHeader::Start(call_num)),
            "cancel" => Ok(FrameHeader::Cancel(call_num)),
            "outcome" => Ok(FrameHeader::Outcome(call_num)),
            other => Err(Error::UnknownVariant(format!("top-level frame: {}", other))),
        };
    }

    Err(Error::MissingField("callNum"))
}
