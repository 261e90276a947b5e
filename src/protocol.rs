//! Minimal realtime protocol codec.
//!
//! The proxy needs just enough of the wire format to recognize the
//! action of a protocol message and to synthesize NACK responses; it is
//! deliberately not a full codec. Text frames carry JSON, binary frames
//! carry a MessagePack encoding of the same envelope. Unknown fields are
//! ignored on read and never produced on write.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

/// Codec errors. Interceptors log these at debug and forward the frame
/// unchanged; they never escape the proxy.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame carries no protocol message (opcode {0})")]
    NotProtocolFrame(&'static str),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("truncated binary payload at offset {0}")]
    Truncated(usize),

    #[error("unsupported binary marker 0x{0:02x} at offset {1}")]
    UnsupportedMarker(u8, usize),

    #[error("binary payload is not a protocol message map")]
    NotAMap,

    #[error("binary payload has no action field")]
    MissingAction,

    #[error("invalid UTF-8 in binary string field")]
    InvalidUtf8,

    #[error("unknown protocol action {0}")]
    UnknownAction(u64),
}

/// Protocol message actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAction {
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
}

impl MessageAction {
    pub fn code(self) -> u64 {
        match self {
            MessageAction::Heartbeat => 0,
            MessageAction::Ack => 1,
            MessageAction::Nack => 2,
            MessageAction::Connect => 3,
            MessageAction::Connected => 4,
            MessageAction::Disconnect => 5,
            MessageAction::Disconnected => 6,
            MessageAction::Close => 7,
            MessageAction::Closed => 8,
            MessageAction::Error => 9,
            MessageAction::Attach => 10,
            MessageAction::Attached => 11,
            MessageAction::Detach => 12,
            MessageAction::Detached => 13,
            MessageAction::Presence => 14,
            MessageAction::Message => 15,
            MessageAction::Sync => 16,
            MessageAction::Auth => 17,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => MessageAction::Heartbeat,
            1 => MessageAction::Ack,
            2 => MessageAction::Nack,
            3 => MessageAction::Connect,
            4 => MessageAction::Connected,
            5 => MessageAction::Disconnect,
            6 => MessageAction::Disconnected,
            7 => MessageAction::Close,
            8 => MessageAction::Closed,
            9 => MessageAction::Error,
            10 => MessageAction::Attach,
            11 => MessageAction::Attached,
            12 => MessageAction::Detach,
            13 => MessageAction::Detached,
            14 => MessageAction::Presence,
            15 => MessageAction::Message,
            16 => MessageAction::Sync,
            17 => MessageAction::Auth,
            _ => return None,
        })
    }
}

/// Presence message actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl PresenceAction {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0 => PresenceAction::Absent,
            1 => PresenceAction::Present,
            2 => PresenceAction::Enter,
            3 => PresenceAction::Leave,
            4 => PresenceAction::Update,
            _ => return None,
        })
    }
}

/// Read-only view of a decoded protocol message. Only the fields the
/// fault catalog inspects.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub action: MessageAction,
    pub channel: Option<String>,
    pub msg_serial: Option<i64>,
    pub presence: Vec<PresenceAction>,
}

impl WireMessage {
    /// Whether the message carries a presence entry with the given action.
    pub fn has_presence_action(&self, action: PresenceAction) -> bool {
        self.action == MessageAction::Presence && self.presence.contains(&action)
    }
}

/// Decode the protocol message carried by a WebSocket frame.
pub fn decode_message(frame: &Message) -> Result<WireMessage, CodecError> {
    match frame {
        Message::Text(text) => decode_json(text),
        Message::Binary(bytes) => decode_msgpack(bytes),
        Message::Ping(_) => Err(CodecError::NotProtocolFrame("ping")),
        Message::Pong(_) => Err(CodecError::NotProtocolFrame("pong")),
        Message::Close(_) => Err(CodecError::NotProtocolFrame("close")),
        Message::Frame(_) => Err(CodecError::NotProtocolFrame("raw")),
    }
}

/// Synthesize a NACK answering the given message, in the same encoding
/// as the frame it answers.
pub fn encode_nack(original: &WireMessage, binary: bool, code: u64, status_code: u64, reason: &str) -> Message {
    if binary {
        Message::Binary(encode_nack_msgpack(original, code, status_code, reason))
    } else {
        let envelope = JsonEnvelope {
            action: MessageAction::Nack.code(),
            channel: original.channel.clone(),
            msg_serial: original.msg_serial,
            count: Some(1),
            error: Some(JsonErrorInfo {
                message: reason.to_string(),
                code,
                status_code,
            }),
            presence: None,
        };
        // Serialization of this envelope cannot fail; fall back to an
        // empty object rather than panicking in the forwarding path.
        let text = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
        Message::Text(text)
    }
}

// ---------------------------------------------------------------------
// JSON envelope
// ---------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonEnvelope {
    action: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presence: Option<Vec<JsonPresenceEntry>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonErrorInfo {
    message: String,
    code: u64,
    status_code: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonPresenceEntry {
    action: u64,
}

fn decode_json(text: &str) -> Result<WireMessage, CodecError> {
    let envelope: JsonEnvelope = serde_json::from_str(text)?;
    let action =
        MessageAction::from_code(envelope.action).ok_or(CodecError::UnknownAction(envelope.action))?;
    let presence = envelope
        .presence
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| PresenceAction::from_code(entry.action))
        .collect();

    Ok(WireMessage {
        action,
        channel: envelope.channel,
        msg_serial: envelope.msg_serial,
        presence,
    })
}

// ---------------------------------------------------------------------
// MessagePack subset
// ---------------------------------------------------------------------
//
// The binary envelope is a MessagePack map of string keys. The reader
// below understands exactly the types the envelope uses (nil, bool,
// ints, floats, str, bin, array, map); extension types are rejected.

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            Value::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Uint(n) if *n <= i64::MAX as u64 => Some(*n as i64),
            _ => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn str(&mut self, len: usize) -> Result<Value, CodecError> {
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Value::Str(text.to_string()))
    }

    fn array(&mut self, len: usize) -> Result<Value, CodecError> {
        let mut items = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            items.push(self.value()?);
        }
        Ok(Value::Array(items))
    }

    fn map(&mut self, len: usize) -> Result<Value, CodecError> {
        let mut entries = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let key = self.value()?;
            let value = self.value()?;
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }

    fn value(&mut self) -> Result<Value, CodecError> {
        let at = self.pos;
        let marker = self.u8()?;
        match marker {
            0x00..=0x7f => Ok(Value::Uint(u64::from(marker))),
            0x80..=0x8f => self.map((marker & 0x0f) as usize),
            0x90..=0x9f => self.array((marker & 0x0f) as usize),
            0xa0..=0xbf => self.str((marker & 0x1f) as usize),
            0xc0 => Ok(Value::Nil),
            0xc2 => Ok(Value::Bool(false)),
            0xc3 => Ok(Value::Bool(true)),
            0xc4 => {
                let len = self.u8()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc5 => {
                let len = self.u16()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xc6 => {
                let len = self.u32()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            0xca => {
                let bits = self.u32()?;
                Ok(Value::Float(f64::from(f32::from_bits(bits))))
            }
            0xcb => {
                let bits = self.u64()?;
                Ok(Value::Float(f64::from_bits(bits)))
            }
            0xcc => Ok(Value::Uint(u64::from(self.u8()?))),
            0xcd => Ok(Value::Uint(u64::from(self.u16()?))),
            0xce => Ok(Value::Uint(u64::from(self.u32()?))),
            0xcf => Ok(Value::Uint(self.u64()?)),
            0xd0 => Ok(Value::Int(i64::from(self.u8()? as i8))),
            0xd1 => Ok(Value::Int(i64::from(self.u16()? as i16))),
            0xd2 => Ok(Value::Int(i64::from(self.u32()? as i32))),
            0xd3 => Ok(Value::Int(self.u64()? as i64)),
            0xd9 => {
                let len = self.u8()? as usize;
                self.str(len)
            }
            0xda => {
                let len = self.u16()? as usize;
                self.str(len)
            }
            0xdb => {
                let len = self.u32()? as usize;
                self.str(len)
            }
            0xdc => {
                let len = self.u16()? as usize;
                self.array(len)
            }
            0xdd => {
                let len = self.u32()? as usize;
                self.array(len)
            }
            0xde => {
                let len = self.u16()? as usize;
                self.map(len)
            }
            0xdf => {
                let len = self.u32()? as usize;
                self.map(len)
            }
            0xe0..=0xff => Ok(Value::Int(i64::from(marker as i8))),
            other => Err(CodecError::UnsupportedMarker(other, at)),
        }
    }
}

fn decode_msgpack(bytes: &[u8]) -> Result<WireMessage, CodecError> {
    let mut reader = Reader::new(bytes);
    let entries = match reader.value()? {
        Value::Map(entries) => entries,
        _ => return Err(CodecError::NotAMap),
    };

    let mut action_code = None;
    let mut channel = None;
    let mut msg_serial = None;
    let mut presence = Vec::new();

    for (key, value) in &entries {
        let key = match key {
            Value::Str(key) => key.as_str(),
            _ => continue,
        };
        match key {
            "action" => action_code = value.as_u64(),
            "channel" => {
                if let Value::Str(name) = value {
                    channel = Some(name.clone());
                }
            }
            "msgSerial" => msg_serial = value.as_i64(),
            "presence" => {
                if let Value::Array(items) = value {
                    for item in items {
                        if let Value::Map(fields) = item {
                            for (k, v) in fields {
                                if matches!(k, Value::Str(name) if name == "action") {
                                    if let Some(code) =
                                        v.as_u64().and_then(PresenceAction::from_code)
                                    {
                                        presence.push(code);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let code = action_code.ok_or(CodecError::MissingAction)?;
    let action = MessageAction::from_code(code).ok_or(CodecError::UnknownAction(code))?;

    Ok(WireMessage {
        action,
        channel,
        msg_serial,
        presence,
    })
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn map_len(&mut self, len: usize) {
        debug_assert!(len <= 15, "envelope maps are always small");
        self.buf.push(0x80 | (len as u8));
    }

    fn str(&mut self, text: &str) {
        let bytes = text.as_bytes();
        if bytes.len() <= 31 {
            self.buf.push(0xa0 | (bytes.len() as u8));
        } else if bytes.len() <= u8::MAX as usize {
            self.buf.push(0xd9);
            self.buf.push(bytes.len() as u8);
        } else {
            self.buf.push(0xda);
            self.buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        }
        self.buf.extend_from_slice(bytes);
    }

    fn uint(&mut self, n: u64) {
        if n <= 0x7f {
            self.buf.push(n as u8);
        } else if n <= u8::MAX as u64 {
            self.buf.push(0xcc);
            self.buf.push(n as u8);
        } else if n <= u16::MAX as u64 {
            self.buf.push(0xcd);
            self.buf.extend_from_slice(&(n as u16).to_be_bytes());
        } else if n <= u32::MAX as u64 {
            self.buf.push(0xce);
            self.buf.extend_from_slice(&(n as u32).to_be_bytes());
        } else {
            self.buf.push(0xcf);
            self.buf.extend_from_slice(&n.to_be_bytes());
        }
    }

    fn int(&mut self, n: i64) {
        if n >= 0 {
            self.uint(n as u64);
        } else if n >= -32 {
            self.buf.push(n as u8);
        } else {
            self.buf.push(0xd3);
            self.buf.extend_from_slice(&n.to_be_bytes());
        }
    }
}

fn encode_nack_msgpack(original: &WireMessage, code: u64, status_code: u64, reason: &str) -> Vec<u8> {
    let mut w = Writer::new();

    let mut fields = 3; // action, count, error
    if original.channel.is_some() {
        fields += 1;
    }
    if original.msg_serial.is_some() {
        fields += 1;
    }
    w.map_len(fields);

    w.str("action");
    w.uint(MessageAction::Nack.code());
    if let Some(channel) = &original.channel {
        w.str("channel");
        w.str(channel);
    }
    if let Some(serial) = original.msg_serial {
        w.str("msgSerial");
        w.int(serial);
    }
    w.str("count");
    w.uint(1);
    w.str("error");
    w.map_len(3);
    w.str("message");
    w.str(reason);
    w.str("code");
    w.uint(code);
    w.str("statusCode");
    w.uint(status_code);

    w.buf
}
