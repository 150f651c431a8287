// Copyright 2020 Joyent, Inc.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::buffer::Buffer;
use crate::codec::{Codec, CodecError, FrameDetector, FrameStatus, Reply};

pub const DUBBO_MAGIC: u16 = 0xdabb;
const DUBBO_MAGIC_HI: u8 = 0xda;
const DUBBO_MAGIC_LO: u8 = 0xbb;

const DP_OFF_FLAG: usize = 0x2;
const DP_OFF_STATUS: usize = 0x3;
const DP_OFF_ID: usize = 0x4;
const DP_OFF_DATALEN: usize = 0xc;
const DP_OFF_DATA: usize = 0x10;

pub const DP_HEADER_SZ: usize = DP_OFF_DATA;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWOWAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1f;

/// Largest body accepted in either direction.
pub const DP_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

pub const DUBBO_VERSION: &str = "2.0.2";
pub const DEFAULT_SERVICE_VERSION: &str = "0.0.0";

const INITIAL_BODY_SZ: usize = 256;

static NULL_VALUE: Value = Value::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Serialization {
    Hessian2 = 2,
    Java = 3,
    CompactedJava = 4,
    FastJson = 6,
    NativeJava = 7,
    Kryo = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ResponseStatus {
    Ok = 20,
    ClientTimeout = 30,
    ServerTimeout = 31,
    ChannelInactive = 35,
    BadRequest = 40,
    BadResponse = 50,
    ServiceNotFound = 60,
    ServiceError = 70,
    ServerError = 80,
    ClientError = 90,
    ThreadpoolExhausted = 100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ResponseFlag {
    WithException = 0,
    Value = 1,
    NullValue = 2,
    WithExceptionWithAttachments = 3,
    ValueWithAttachments = 4,
    NullValueWithAttachments = 5,
}

impl ResponseFlag {
    fn has_attachments(self) -> bool {
        matches!(
            self,
            ResponseFlag::WithExceptionWithAttachments
                | ResponseFlag::ValueWithAttachments
                | ResponseFlag::NullValueWithAttachments
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flag: u8,
    pub status: u8,
    pub id: u64,
    pub data_len: usize,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Result<Header, CodecError> {
        if buf.len() < DP_HEADER_SZ {
            return Err(CodecError::Incomplete {
                needed: DP_HEADER_SZ - buf.len(),
            });
        }
        if BigEndian::read_u16(&buf[..DP_OFF_FLAG]) != DUBBO_MAGIC {
            return Err(CodecError::InvalidFrame(String::from("bad magic")));
        }

        Ok(Header {
            flag: buf[DP_OFF_FLAG],
            status: buf[DP_OFF_STATUS],
            id: BigEndian::read_u64(&buf[DP_OFF_ID..DP_OFF_DATALEN]),
            data_len: BigEndian::read_u32(&buf[DP_OFF_DATALEN..DP_OFF_DATA]) as usize,
        })
    }

    pub fn is_request(&self) -> bool {
        self.flag & FLAG_REQUEST != 0
    }

    pub fn is_two_way(&self) -> bool {
        self.flag & FLAG_TWOWAY != 0
    }

    pub fn is_event(&self) -> bool {
        self.flag & FLAG_EVENT != 0
    }

    pub fn serialization(&self) -> Option<Serialization> {
        FromPrimitive::from_u8(self.flag & SERIALIZATION_MASK)
    }

    /// Write the header in front of a body already sitting in `buf`.
    fn prepend_to(&self, buf: &mut Buffer) -> Result<(), CodecError> {
        buf.prepend_u32::<BigEndian>(self.data_len as u32)?;
        buf.prepend_u64::<BigEndian>(self.id)?;
        buf.prepend_u8(self.status)?;
        buf.prepend_u8(self.flag)?;
        buf.prepend_u16::<BigEndian>(DUBBO_MAGIC)?;
        Ok(())
    }
}

fn fastjson_flag(base: u8) -> u8 {
    let ser = ToPrimitive::to_u8(&Serialization::FastJson).unwrap_or(6);
    base | ser
}

pub fn looks_like_frame(buf: &[u8]) -> bool {
    match buf.len() {
        0 => true,
        1 => buf[0] == DUBBO_MAGIC_HI,
        n => {
            if buf[0] != DUBBO_MAGIC_HI || buf[1] != DUBBO_MAGIC_LO {
                return false;
            }
            if n < DP_HEADER_SZ {
                return true;
            }
            let data_len = BigEndian::read_u32(&buf[DP_OFF_DATALEN..DP_OFF_DATA]);
            data_len as usize <= DP_MAX_PAYLOAD
        }
    }
}

pub fn frame_status(buf: &[u8]) -> FrameStatus {
    if buf.len() < DP_HEADER_SZ {
        return FrameStatus::Incomplete {
            needed: DP_HEADER_SZ - buf.len(),
        };
    }
    let data_len = BigEndian::read_u32(&buf[DP_OFF_DATALEN..DP_OFF_DATA]) as usize;
    let len = DP_HEADER_SZ + data_len;
    if buf.len() < len {
        FrameStatus::Incomplete {
            needed: len - buf.len(),
        }
    } else {
        FrameStatus::Complete { len }
    }
}

fn default_service_version() -> String {
    String::from(DEFAULT_SERVICE_VERSION)
}

/// One remote method call: what the client sends on every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub attachments: Map<String, Value>,
    #[serde(default = "default_service_version")]
    pub version: String,
    /// JVM parameter descriptor, e.g. `Ljava/lang/String;J`. Inferred from
    /// the argument values when absent.
    #[serde(default)]
    pub parameter_types: Option<String>,
}

impl Invocation {
    pub fn new(service: &str, method: &str, args: Vec<Value>) -> Invocation {
        Invocation {
            service: String::from(service),
            method: String::from(method),
            args,
            attachments: Map::new(),
            version: default_service_version(),
            parameter_types: None,
        }
    }

    pub fn with_attachment(mut self, key: &str, value: Value) -> Invocation {
        self.attachments.insert(String::from(key), value);
        self
    }

    pub fn parameter_desc(&self) -> String {
        match &self.parameter_types {
            Some(types) => types.clone(),
            None => self.args.iter().map(java_type_desc).collect(),
        }
    }
}

fn java_type_desc(v: &Value) -> &'static str {
    match v {
        Value::Bool(_) => "Z",
        Value::Number(n) if n.is_f64() => "D",
        Value::Number(_) => "J",
        Value::String(_) => "Ljava/lang/String;",
        Value::Array(_) => "Ljava/util/List;",
        Value::Object(_) => "Ljava/util/Map;",
        Value::Null => "Ljava/lang/Object;",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub status: u8,
    pub event: bool,
    pub ok: bool,
    pub data: Option<Value>,
    pub description: Option<String>,
    pub attachments: Map<String, Value>,
}

impl Response {
    pub fn status(&self) -> Option<ResponseStatus> {
        FromPrimitive::from_u8(self.status)
    }

    /// The returned value, or the error description reported by the peer.
    pub fn result(&self) -> Result<&Value, &str> {
        if self.ok {
            Ok(self.data.as_ref().unwrap_or(&NULL_VALUE))
        } else {
            Err(self.description.as_deref().unwrap_or("unknown error"))
        }
    }
}

impl Reply for Response {
    fn is_ok(&self) -> bool {
        self.ok
    }

    fn is_event(&self) -> bool {
        self.event
    }
}

fn body_values(body: &[u8]) -> Result<Vec<Value>, CodecError> {
    serde_json::Deserializer::from_slice(body)
        .into_iter::<Value>()
        .collect::<Result<Vec<Value>, _>>()
        .map_err(CodecError::from)
}

fn write_line<W: Write>(w: &mut W, v: &Value) -> Result<(), CodecError> {
    serde_json::to_writer(&mut *w, v)?;
    w.write_all(b"\n")?;
    Ok(())
}

fn describe_exception(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| v.to_string()),
        _ => v.to_string(),
    }
}

/// Parse one whole frame as a response.
pub fn parse_response(frame: &[u8]) -> Result<Response, CodecError> {
    let header = Header::parse(frame)?;
    if frame.len() < DP_HEADER_SZ + header.data_len {
        let msg = "Data payload size does not match indicated data length";
        return Err(CodecError::Decode(String::from(msg)));
    }
    match header.serialization() {
        Some(Serialization::FastJson) => (),
        _ => {
            let msg = format!("unsupported serialization id {}", header.flag & SERIALIZATION_MASK);
            return Err(CodecError::Decode(msg));
        }
    }

    let mut values = body_values(&frame[DP_OFF_DATA..DP_OFF_DATA + header.data_len])?.into_iter();
    let mut response = Response {
        id: header.id,
        status: header.status,
        event: header.is_event(),
        ok: true,
        data: None,
        description: None,
        attachments: Map::new(),
    };

    if response.event {
        response.data = values.next();
        return Ok(response);
    }

    if response.status() != Some(ResponseStatus::Ok) {
        response.ok = false;
        response.description = Some(match values.next() {
            Some(v) => describe_exception(&v),
            None => format!("response status {}", header.status),
        });
        return Ok(response);
    }

    let flag: ResponseFlag = values
        .next()
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(FromPrimitive::from_u64)
        .ok_or_else(|| CodecError::Decode(String::from("Failed to parse response flag")))?;

    match flag {
        ResponseFlag::Value | ResponseFlag::ValueWithAttachments => {
            response.data = Some(values.next().ok_or_else(|| {
                CodecError::Decode(String::from("response value missing"))
            })?);
        }
        ResponseFlag::WithException | ResponseFlag::WithExceptionWithAttachments => {
            let exception = values.next().unwrap_or(Value::Null);
            response.ok = false;
            response.description = Some(describe_exception(&exception));
            response.data = Some(exception);
        }
        ResponseFlag::NullValue | ResponseFlag::NullValueWithAttachments => (),
    }

    if flag.has_attachments() {
        if let Some(Value::Object(attachments)) = values.next() {
            response.attachments = attachments;
        }
    }

    Ok(response)
}

/// Client side codec: allocates request ids sequentially.
#[derive(Debug, Default)]
pub struct DubboCodec {
    next_id: u64,
}

impl DubboCodec {
    pub fn new() -> DubboCodec {
        DubboCodec { next_id: 0 }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

impl FrameDetector for DubboCodec {
    fn looks_like_frame(&self, buf: &[u8]) -> bool {
        looks_like_frame(buf)
    }

    fn frame_status(&self, buf: &[u8]) -> FrameStatus {
        frame_status(buf)
    }
}

impl Codec for DubboCodec {
    type Request = Invocation;
    type Response = Response;

    fn encode_request(&mut self, req: &Invocation) -> Result<Buffer, CodecError> {
        let mut attachments = req.attachments.clone();
        for key in &["path", "interface"] {
            attachments
                .entry(*key)
                .or_insert_with(|| Value::String(req.service.clone()));
        }
        attachments
            .entry("version")
            .or_insert_with(|| Value::String(req.version.clone()));

        let mut buf = Buffer::with_reserve(DP_HEADER_SZ, INITIAL_BODY_SZ);
        write_line(&mut buf, &Value::from(DUBBO_VERSION))?;
        write_line(&mut buf, &Value::from(req.service.as_str()))?;
        write_line(&mut buf, &Value::from(req.version.as_str()))?;
        write_line(&mut buf, &Value::from(req.method.as_str()))?;
        write_line(&mut buf, &Value::from(req.parameter_desc()))?;
        for arg in &req.args {
            write_line(&mut buf, arg)?;
        }
        write_line(&mut buf, &Value::Object(attachments))?;

        let data_len = buf.readable_bytes();
        if data_len > DP_MAX_PAYLOAD {
            let msg = format!("request body of {} bytes exceeds payload limit", data_len);
            return Err(CodecError::Encode(msg));
        }

        let header = Header {
            flag: fastjson_flag(FLAG_REQUEST | FLAG_TWOWAY),
            status: 0,
            id: self.allocate_id(),
            data_len,
        };
        header.prepend_to(&mut buf)?;
        Ok(buf)
    }

    fn decode_response(&mut self, buf: &mut Buffer) -> Result<Response, CodecError> {
        let len = match frame_status(buf.peek()) {
            FrameStatus::Complete { len } => len,
            FrameStatus::Incomplete { needed } => {
                return Err(CodecError::Incomplete { needed })
            }
        };
        let result = parse_response(&buf.peek()[..len]);
        buf.retrieve(len)?;
        result
    }
}

/// A raw frame as seen by the provider side.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    fn with_body(flag: u8, status: u8, id: u64, body: BytesMut) -> Frame {
        Frame {
            header: Header {
                flag,
                status,
                id,
                data_len: body.len(),
            },
            body: body.freeze(),
        }
    }

    /// A response frame carrying either a returned value or an error message.
    pub fn response(id: u64, result: Result<Value, String>) -> Result<Frame, CodecError> {
        let mut w = BytesMut::with_capacity(INITIAL_BODY_SZ).writer();
        let status = match result {
            Ok(Value::Null) => {
                write_line(&mut w, &Value::from(ResponseFlag::NullValue as u8))?;
                ResponseStatus::Ok
            }
            Ok(v) => {
                write_line(&mut w, &Value::from(ResponseFlag::Value as u8))?;
                write_line(&mut w, &v)?;
                ResponseStatus::Ok
            }
            Err(msg) => {
                write_line(&mut w, &Value::String(msg))?;
                ResponseStatus::ServiceError
            }
        };
        let status = ToPrimitive::to_u8(&status).unwrap_or(0);
        Ok(Frame::with_body(fastjson_flag(0), status, id, w.into_inner()))
    }

    /// Reply to a heartbeat request.
    pub fn heartbeat_response(id: u64) -> Frame {
        let status = ToPrimitive::to_u8(&ResponseStatus::Ok).unwrap_or(20);
        let body = BytesMut::from(&b"null\n"[..]);
        Frame::with_body(fastjson_flag(FLAG_EVENT), status, id, body)
    }

    pub fn heartbeat_request(id: u64) -> Frame {
        let body = BytesMut::from(&b"null\n"[..]);
        Frame::with_body(
            fastjson_flag(FLAG_REQUEST | FLAG_TWOWAY | FLAG_EVENT),
            0,
            id,
            body,
        )
    }

    /// Parse the body of a request frame back into an invocation.
    pub fn invocation(&self) -> Result<Invocation, CodecError> {
        if !self.header.is_request() || self.header.is_event() {
            return Err(CodecError::Decode(String::from("not an invocation")));
        }
        let mut values = body_values(&self.body)?;
        if values.len() < 6 {
            return Err(CodecError::Decode(String::from("truncated invocation body")));
        }

        let attachments = match values.pop() {
            Some(Value::Object(map)) => map,
            _ => return Err(CodecError::Decode(String::from("attachments missing"))),
        };
        let mut fields = values.drain(..5).map(|v| match v {
            Value::String(s) => Ok(s),
            _ => Err(CodecError::Decode(String::from("expected string field"))),
        });
        let _dubbo_version = fields.next().transpose()?;
        let service = fields.next().transpose()?.unwrap_or_default();
        let version = fields.next().transpose()?.unwrap_or_default();
        let method = fields.next().transpose()?.unwrap_or_default();
        let parameter_types = fields.next().transpose()?;
        drop(fields);

        Ok(Invocation {
            service,
            method,
            args: values,
            attachments,
            version,
            parameter_types,
        })
    }

    pub fn encoded_len(&self) -> usize {
        DP_HEADER_SZ + self.body.len()
    }
}

/// Framing of raw frames for use with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if !looks_like_frame(buf) {
            return Err(CodecError::InvalidFrame(String::from("not a dubbo frame")));
        }
        match frame_status(buf) {
            FrameStatus::Incomplete { needed } => {
                buf.reserve(needed);
                Ok(None)
            }
            FrameStatus::Complete { len } => {
                let raw = buf.split_to(len).freeze();
                let header = Header::parse(&raw)?;
                Ok(Some(Frame {
                    header,
                    body: raw.slice(DP_HEADER_SZ..),
                }))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        if item.body.len() > DP_MAX_PAYLOAD {
            let msg = format!("body of {} bytes exceeds payload limit", item.body.len());
            return Err(CodecError::Encode(msg));
        }
        buf.reserve(item.encoded_len());
        buf.put_u16(DUBBO_MAGIC);
        buf.put_u8(item.header.flag);
        buf.put_u8(item.header.status);
        buf.put_u64(item.header.id);
        buf.put_u32(item.body.len() as u32);
        buf.put_slice(&item.body);
        Ok(())
    }
}
