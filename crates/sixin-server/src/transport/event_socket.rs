//! Event-socket transport: Engine.IO v4 / Socket.IO v5 over WebSocket.
//!
//! ```text
//! server: 0{"sid":..,"pingInterval":25000,..}
//! client: 40{"token":".."}          (or 40 with ?token= in the URL)
//! server: 40{"sid":..}              on success
//!         42["error",msg] + 44{..}  on failure, then close
//! ```

use super::websocket::{self, Decoded, Framing, WsStream};
use super::TransportSettings;
use crate::gateway::Gateway;
use rand::RngCore;
use serde_json::{json, Value};
use sixin_core::codec::{decode_socket_event, encode_socket_event, EngineHandshake, EnginePacket, SocketPacket};
use sixin_core::{ServerEvent, SixinError, SixinResult, TransportKind};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub struct EventSocketFraming;

impl Framing for EventSocketFraming {
    fn decode(&mut self, text: &str) -> Decoded {
        let packet = match EnginePacket::decode(text) {
            Ok(packet) => packet,
            Err(e) => return Decoded::Malformed(e),
        };
        match packet {
            EnginePacket::Ping(data) => Decoded::Reply(EnginePacket::Pong(data).encode()),
            EnginePacket::Pong(_) => Decoded::Pong,
            EnginePacket::Close => Decoded::Disconnect,
            EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                Ok(SocketPacket::Event { name, args, .. }) => {
                    match decode_socket_event(&name, &args) {
                        Ok(event) => Decoded::Event(event),
                        Err(e) => Decoded::Malformed(e),
                    }
                }
                Ok(SocketPacket::Disconnect) => Decoded::Disconnect,
                Ok(SocketPacket::Connect(_)) => {
                    Decoded::Malformed(SixinError::Protocol("already connected".into()))
                }
                Ok(_) => Decoded::Ignore,
                Err(e) => Decoded::Malformed(e),
            },
            EnginePacket::Open(_) | EnginePacket::Upgrade | EnginePacket::Noop => Decoded::Ignore,
        }
    }

    fn encode(&self, event: &ServerEvent) -> SixinResult<String> {
        encode_socket_event(event)
    }

    fn heartbeat(&self) -> Message {
        Message::Text(EnginePacket::Ping(String::new()).encode().into())
    }

    fn farewell(&self) -> Option<String> {
        SocketPacket::Disconnect.to_frame().ok()
    }
}

fn new_sid() -> String {
    let mut sid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut sid);
    hex::encode(sid)
}

/// Wait for the client's socket `connect` packet.
///
/// Returns `None` if the client went away first.
async fn await_connect(ws: &mut WsStream, max_frame_size: usize) -> SixinResult<Option<Option<Value>>> {
    loop {
        let Some(frame) = websocket::recv_text(ws, max_frame_size).await? else {
            return Ok(None);
        };
        match EnginePacket::decode(&frame)? {
            EnginePacket::Message(body) => {
                return match SocketPacket::decode(&body)? {
                    SocketPacket::Connect(data) => Ok(Some(data)),
                    _ => Err(SixinError::Protocol("expected a connect packet".into())),
                };
            }
            EnginePacket::Close => return Ok(None),
            EnginePacket::Ping(data) => {
                websocket::send_text(ws, EnginePacket::Pong(data).encode()).await?;
            }
            EnginePacket::Pong(_) | EnginePacket::Noop => {}
            EnginePacket::Open(_) | EnginePacket::Upgrade => {
                return Err(SixinError::Protocol("unexpected packet before connect".into()));
            }
        }
    }
}

async fn reject(ws: &mut WsStream, message: String) {
    if let Ok(frame) = encode_socket_event(&ServerEvent::Error(message.clone())) {
        let _ = websocket::send_text(ws, frame).await;
    }
    if let Ok(frame) = SocketPacket::ConnectError(json!({ "message": message })).to_frame() {
        let _ = websocket::send_text(ws, frame).await;
    }
    let _ = ws.close(None).await;
}

/// Serve one event-socket client from open handshake to close.
pub async fn serve(
    gateway: &Gateway,
    mut ws: WsStream,
    remote: SocketAddr,
    query_token: Option<String>,
    settings: &TransportSettings,
    shutdown: broadcast::Receiver<()>,
) -> SixinResult<()> {
    let sid = new_sid();
    let handshake = EngineHandshake {
        sid: sid.clone(),
        upgrades: Vec::new(),
        ping_interval: settings.ping_interval.as_millis() as u64,
        ping_timeout: settings.ping_timeout.as_millis() as u64,
        max_payload: settings.max_frame_size as u64,
    };
    websocket::send_text(&mut ws, handshake.packet()?.encode()).await?;

    let connect = tokio::time::timeout(
        settings.handshake_timeout,
        await_connect(&mut ws, settings.max_frame_size),
    )
    .await;
    let data = match connect {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            debug!(%remote, "client left before connecting");
            return Ok(());
        }
        Ok(Err(e)) => {
            reject(&mut ws, e.client_message()).await;
            return Err(e);
        }
        Err(_) => {
            reject(&mut ws, "connect timeout".into()).await;
            return Err(SixinError::Timeout);
        }
    };

    let token = data
        .as_ref()
        .and_then(|d| d.get("token"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(query_token)
        .unwrap_or_default();

    let mut conn = gateway.accept(TransportKind::EventSocket, remote.ip());
    if let Err(e) = gateway.authenticate(&mut conn, &token).await {
        warn!(%remote, "event socket rejected");
        reject(&mut ws, e.client_message()).await;
        return Ok(());
    }

    let ack = SocketPacket::Connect(Some(json!({ "sid": sid }))).to_frame()?;
    websocket::send_text(&mut ws, ack).await?;

    let outbound = gateway.activate(&mut conn).await?;
    websocket::drive(gateway, conn, ws, EventSocketFraming, outbound, shutdown, settings).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sixin_core::ClientEvent;

    #[test]
    fn engine_ping_is_answered_in_place() {
        let mut framing = EventSocketFraming;
        match framing.decode("2probe") {
            Decoded::Reply(text) => assert_eq!(text, "3probe"),
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(matches!(framing.decode("3"), Decoded::Pong));
    }

    #[test]
    fn socket_events_become_client_events() {
        let mut framing = EventSocketFraming;
        assert!(matches!(
            framing.decode(r#"42["getUsers"]"#),
            Decoded::Event(ClientEvent::GetUsers)
        ));
        assert!(matches!(
            framing.decode(r#"42["deleteRoom",7]"#),
            Decoded::Event(ClientEvent::DeleteRoom { room_id: 7 })
        ));
    }

    #[test]
    fn bad_frames_are_malformed_not_fatal() {
        let mut framing = EventSocketFraming;
        assert!(matches!(framing.decode("9"), Decoded::Malformed(_)));
        assert!(matches!(framing.decode("42{}"), Decoded::Malformed(_)));
        assert!(matches!(framing.decode(r#"42["noSuchEvent"]"#), Decoded::Malformed(_)));
        assert!(matches!(
            framing.decode("451-[\"x\",{\"_placeholder\":true,\"num\":0}]"),
            Decoded::Malformed(SixinError::Protocol(_))
        ));
    }

    #[test]
    fn disconnects_and_acks() {
        let mut framing = EventSocketFraming;
        assert!(matches!(framing.decode("41"), Decoded::Disconnect));
        assert!(matches!(framing.decode("1"), Decoded::Disconnect));
        assert!(matches!(framing.decode("433[]"), Decoded::Ignore));
        assert!(matches!(framing.decode("6"), Decoded::Ignore));
    }

    #[test]
    fn outbound_events_use_socket_framing() {
        let framing = EventSocketFraming;
        assert_eq!(
            framing.encode(&ServerEvent::Receive(true)).unwrap(),
            r#"42["receive",true]"#
        );
        assert_eq!(framing.farewell().as_deref(), Some("41"));
    }
}
