//! Text framing for the two client transports.
//!
//! The event socket speaks Engine.IO v4 packets carrying Socket.IO v5
//! packets, one per WebSocket text frame:
//!
//! ```text
//! 0{"sid":...}        engine open       (server -> client)
//! 2 / 3               ping / pong
//! 40{"token":...}     socket connect    (client -> server)
//! 42["name",arg...]   socket event
//! 44{"message":...}   socket connect error
//! ```
//!
//! The plain socket carries one `{"type": ..., "data": ...}` JSON object per frame.

use crate::error::{SixinError, SixinResult};
use crate::messages::{ClientEvent, ServerEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine.IO packet, the outer layer of an event-socket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(String),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> SixinResult<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SixinError::Codec("empty engine packet".into()))?;
        let rest = chars.as_str();
        let packet = match kind {
            '0' => EnginePacket::Open(rest.to_string()),
            '1' => EnginePacket::Close,
            '2' => EnginePacket::Ping(rest.to_string()),
            '3' => EnginePacket::Pong(rest.to_string()),
            '4' => EnginePacket::Message(rest.to_string()),
            '5' => EnginePacket::Upgrade,
            '6' => EnginePacket::Noop,
            other => {
                return Err(SixinError::Codec(format!(
                    "unknown engine packet type: {other:?}"
                )))
            }
        };
        Ok(packet)
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(data) => format!("0{data}"),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// Handshake body sent in the engine `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHandshake {
    pub sid: String,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl EngineHandshake {
    pub fn packet(&self) -> SixinResult<EnginePacket> {
        Ok(EnginePacket::Open(serde_json::to_string(self)?))
    }
}

/// Socket.IO packet, carried inside an engine `message` packet.
///
/// Only the default namespace is served. Binary packets are rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl SocketPacket {
    pub fn decode(body: &str) -> SixinResult<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SixinError::Codec("empty socket packet".into()))?;
        let mut rest = chars.as_str();

        if rest.starts_with('/') {
            let (nsp, tail) = match rest.find(',') {
                Some(i) => (&rest[..i], &rest[i + 1..]),
                None => (rest, ""),
            };
            if nsp != "/" {
                return Err(SixinError::Protocol(format!("unknown namespace: {nsp}")));
            }
            rest = tail;
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|_| SixinError::Codec("ack id out of range".into()))?,
            )
        } else {
            None
        };
        let json = &rest[digits..];

        match kind {
            '0' => {
                let data = if json.is_empty() {
                    None
                } else {
                    Some(serde_json::from_str(json)?)
                };
                Ok(SocketPacket::Connect(data))
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let (name, args) = split_event(json)?;
                Ok(SocketPacket::Event { name, args, ack })
            }
            '3' => {
                let id = ack.ok_or_else(|| SixinError::Codec("ack without id".into()))?;
                let args = match serde_json::from_str(json)? {
                    Value::Array(a) => a,
                    _ => return Err(SixinError::Codec("ack payload must be an array".into())),
                };
                Ok(SocketPacket::Ack { id, args })
            }
            '4' => Ok(SocketPacket::ConnectError(serde_json::from_str(json)?)),
            '5' | '6' => Err(SixinError::Protocol(
                "binary packets are not supported".into(),
            )),
            other => Err(SixinError::Codec(format!(
                "unknown socket packet type: {other:?}"
            ))),
        }
    }

    pub fn encode(&self) -> SixinResult<String> {
        let out = match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(data)) => format!("0{}", serde_json::to_string(data)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, args, ack } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                let body = serde_json::to_string(&Value::Array(array))?;
                match ack {
                    Some(id) => format!("2{id}{body}"),
                    None => format!("2{body}"),
                }
            }
            SocketPacket::Ack { id, args } => {
                format!("3{id}{}", serde_json::to_string(args)?)
            }
            SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
        };
        Ok(out)
    }

    /// Wrap into an engine message packet and produce the wire text.
    pub fn to_frame(&self) -> SixinResult<String> {
        Ok(EnginePacket::Message(self.encode()?).encode())
    }
}

fn split_event(json: &str) -> SixinResult<(String, Vec<Value>)> {
    let mut array = match serde_json::from_str(json)? {
        Value::Array(a) => a,
        _ => return Err(SixinError::Codec("event payload must be an array".into())),
    };
    if array.is_empty() {
        return Err(SixinError::Codec("event without a name".into()));
    }
    match array.remove(0) {
        Value::String(name) => Ok((name, array)),
        _ => Err(SixinError::Codec("event name must be a string".into())),
    }
}

/// Frame a server event for the event socket: `42["name",payload]`.
pub fn encode_socket_event(event: &ServerEvent) -> SixinResult<String> {
    SocketPacket::Event {
        name: event.name().to_string(),
        args: vec![event.payload()],
        ack: None,
    }
    .to_frame()
}

/// Decode an event-socket `Event` packet into a typed client event.
pub fn decode_socket_event(name: &str, args: &[Value]) -> SixinResult<ClientEvent> {
    ClientEvent::from_socket_event(name, args)
}

/// Plain-socket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Frame a server event for the plain socket.
pub fn encode_envelope(event: &ServerEvent) -> SixinResult<String> {
    let envelope = Envelope {
        kind: event.name().to_string(),
        data: event.payload(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse a plain-socket text frame into a typed client event.
pub fn decode_envelope(frame: &str) -> SixinResult<ClientEvent> {
    let envelope: Envelope = serde_json::from_str(frame)?;
    ClientEvent::from_envelope(&envelope.kind, envelope.data)
}
