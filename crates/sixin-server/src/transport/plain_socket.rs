//! Plain WebSocket transport: one `{"type": .., "data": ..}` JSON object per
//! text frame. The bearer token travels in the `token` query parameter.

use super::websocket::{self, Decoded, Framing, WsStream};
use super::TransportSettings;
use crate::gateway::Gateway;
use sixin_core::codec::{decode_envelope, encode_envelope};
use sixin_core::{ServerEvent, SixinResult, TransportKind};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

pub struct PlainSocketFraming;

impl Framing for PlainSocketFraming {
    fn decode(&mut self, text: &str) -> Decoded {
        match decode_envelope(text) {
            Ok(event) => Decoded::Event(event),
            Err(e) => Decoded::Malformed(e),
        }
    }

    fn encode(&self, event: &ServerEvent) -> SixinResult<String> {
        encode_envelope(event)
    }

    fn heartbeat(&self) -> Message {
        Message::Ping(Vec::new().into())
    }
}

/// Serve one plain-socket client.
pub async fn serve(
    gateway: &Gateway,
    mut ws: WsStream,
    remote: SocketAddr,
    token: Option<String>,
    settings: &TransportSettings,
    shutdown: broadcast::Receiver<()>,
) -> SixinResult<()> {
    let mut conn = gateway.accept(TransportKind::PlainSocket, remote.ip());
    if let Err(e) = gateway
        .authenticate(&mut conn, token.as_deref().unwrap_or_default())
        .await
    {
        warn!(%remote, "plain socket rejected");
        if let Ok(frame) = encode_envelope(&ServerEvent::Error(e.client_message())) {
            let _ = websocket::send_text(&mut ws, frame).await;
        }
        let _ = ws.close(None).await;
        return Ok(());
    }

    let outbound = gateway.activate(&mut conn).await?;
    websocket::drive(gateway, conn, ws, PlainSocketFraming, outbound, shutdown, settings).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sixin_core::{ClientEvent, SixinError};

    #[test]
    fn envelopes_decode_to_events() {
        let mut framing = PlainSocketFraming;
        match framing.decode(r#"{"type":"addFriend","data":{"friend_id":4,"alias":"d","is_private":true}}"#) {
            Decoded::Event(ClientEvent::AddFriend {
                friend_id,
                alias,
                is_private,
            }) => {
                assert_eq!(friend_id, 4);
                assert_eq!(alias, "d");
                assert!(is_private);
            }
            other => panic!("expected addFriend, got {other:?}"),
        }
    }

    #[test]
    fn junk_and_unsupported_types_are_malformed() {
        let mut framing = PlainSocketFraming;
        assert!(matches!(framing.decode("not json"), Decoded::Malformed(SixinError::Codec(_))));
        assert!(matches!(
            framing.decode(r#"{"type":"offer","data":{}}"#),
            Decoded::Malformed(SixinError::Protocol(_))
        ));
    }

    #[test]
    fn outbound_events_are_enveloped() {
        let framing = PlainSocketFraming;
        let text = framing.encode(&ServerEvent::RoomDeleted(9)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "roomDeleted");
        assert!(framing.farewell().is_none());
    }
}
