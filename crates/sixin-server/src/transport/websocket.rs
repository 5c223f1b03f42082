//! WebSocket plumbing shared by both client transports.
//!
//! A single listener serves both framings; the upgrade request path picks
//! one. After authentication each socket is driven by [`pump`], which moves
//! frames between the socket and the gateway until either side gives up.

use super::TransportSettings;
use crate::gateway::{Connection, Gateway, Inbound};
use futures_util::{SinkExt, StreamExt};
use sixin_core::{ClientEvent, ServerEvent, SixinError, SixinResult};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// Capacity of the reader → gateway queue.
const INBOUND_CAPACITY: usize = 64;

/// Which framing an upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    EventSocket { token: Option<String> },
    PlainSocket { token: Option<String> },
}

/// Pick the framing for an upgrade request from its path and query.
pub fn route(path: &str, query: Option<&str>) -> Result<Route, (StatusCode, &'static str)> {
    let token = query_param(query, "token").map(str::to_string);
    match path {
        "/socket.io/" | "/socket.io" => {
            if query_param(query, "EIO") != Some("4") {
                return Err((StatusCode::BAD_REQUEST, "unsupported protocol version"));
            }
            if query_param(query, "transport") != Some("websocket") {
                return Err((StatusCode::BAD_REQUEST, "only the websocket transport is served"));
            }
            Ok(Route::EventSocket { token })
        }
        "/ws" | "/" => Ok(Route::PlainSocket { token }),
        _ => Err((StatusCode::NOT_FOUND, "unknown path")),
    }
}

/// First value of `name` in a raw query string.
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Complete the WebSocket upgrade and resolve the route.
///
/// A client that has not finished the upgrade within `handshake_timeout` is
/// dropped.
pub async fn accept(stream: TcpStream, handshake_timeout: Duration) -> SixinResult<(WsStream, Route)> {
    let mut routed = None;
    let upgrade = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match route(req.uri().path(), req.uri().query()) {
            Ok(r) => {
                routed = Some(r);
                Ok(resp)
            }
            Err((status, reason)) => {
                let mut err = ErrorResponse::new(Some(reason.to_string()));
                *err.status_mut() = status;
                Err(err)
            }
        }
    });
    let ws = tokio::time::timeout(handshake_timeout, upgrade)
        .await
        .map_err(|_| SixinError::Timeout)?
        .map_err(|e| SixinError::Transport(format!("WS handshake failed: {e}")))?;

    let route = routed.ok_or_else(|| SixinError::Transport("upgrade was not routed".into()))?;
    Ok((ws, route))
}

pub async fn send_text(ws: &mut WsStream, text: String) -> SixinResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| SixinError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next text frame.
///
/// Returns `None` if the connection is closed. Pings are answered; binary
/// frames and frames over `max_frame_size` are rejected.
pub async fn recv_text(ws: &mut WsStream, max_frame_size: usize) -> SixinResult<Option<String>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_frame_size {
                    return Err(frame_too_large(text.len(), max_frame_size));
                }
                return Ok(Some(text.as_str().to_string()));
            }
            Some(Ok(Message::Binary(_))) => {
                return Err(SixinError::Protocol("binary frames are not supported".into()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(SixinError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

fn frame_too_large(len: usize, max: usize) -> SixinError {
    SixinError::Protocol(format!("WS frame too large: {len} bytes (max {max})"))
}

/// Result of decoding one inbound text frame.
#[derive(Debug)]
pub enum Decoded {
    Event(ClientEvent),
    Malformed(SixinError),
    /// Transport-level reply written straight back to the socket.
    Reply(String),
    Pong,
    Disconnect,
    Ignore,
}

/// Per-transport text framing.
pub trait Framing: Send {
    fn decode(&mut self, text: &str) -> Decoded;
    fn encode(&self, event: &ServerEvent) -> SixinResult<String>;
    /// Keepalive frame sent every ping interval.
    fn heartbeat(&self) -> Message;
    /// Frame sent before closing on server shutdown.
    fn farewell(&self) -> Option<String> {
        None
    }
}

/// Why [`pump`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    PeerClosed,
    ClientDisconnect,
    HeartbeatTimeout,
    FrameTooLarge,
    GatewayClosed,
    Shutdown,
    SocketError,
}

/// Move frames between `ws` and the gateway until one side stops.
///
/// Dropping `inbound` on exit tells the gateway the client is gone; a closed
/// `outbound` queue tells the pump the gateway is done with the connection.
/// Heartbeat replies keep the socket alive but never reach the gateway, so
/// they do not count as activity for its idle timeout.
pub async fn pump<F: Framing>(
    mut ws: WsStream,
    mut framing: F,
    mut outbound: mpsc::Receiver<ServerEvent>,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: broadcast::Receiver<()>,
    settings: &TransportSettings,
) -> PumpExit {
    let mut ticker = tokio::time::interval(settings.ping_interval);
    ticker.tick().await;
    let mut last_seen = Instant::now();
    let deadline = settings.ping_interval + settings.ping_timeout;

    let exit = loop {
        tokio::select! {
            frame = ws.next() => {
                let decoded = match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if text.len() > settings.max_frame_size {
                            warn!(len = text.len(), "oversized frame, closing");
                            break PumpExit::FrameTooLarge;
                        }
                        framing.decode(text.as_str())
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        if data.len() > settings.max_frame_size {
                            warn!(len = data.len(), "oversized frame, closing");
                            break PumpExit::FrameTooLarge;
                        }
                        Decoded::Malformed(SixinError::Protocol(
                            "binary frames are not supported".into(),
                        ))
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_seen = Instant::now();
                        let _ = ws.send(Message::Pong(payload)).await;
                        Decoded::Ignore
                    }
                    Some(Ok(Message::Pong(_))) => Decoded::Pong,
                    Some(Ok(Message::Close(_))) | None => break PumpExit::PeerClosed,
                    Some(Ok(Message::Frame(_))) => Decoded::Ignore,
                    Some(Err(e)) => {
                        debug!(error = %e, "WS recv failed");
                        break PumpExit::SocketError;
                    }
                };

                let forward = match decoded {
                    Decoded::Event(event) => Inbound::Event(event),
                    Decoded::Malformed(e) => Inbound::Malformed(e),
                    Decoded::Reply(text) => {
                        if send_text(&mut ws, text).await.is_err() {
                            break PumpExit::SocketError;
                        }
                        continue;
                    }
                    Decoded::Pong => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Decoded::Disconnect => break PumpExit::ClientDisconnect,
                    Decoded::Ignore => continue,
                };
                if inbound.send(forward).await.is_err() {
                    break PumpExit::GatewayClosed;
                }
            }

            event = outbound.recv() => {
                let Some(event) = event else {
                    break PumpExit::GatewayClosed;
                };
                match framing.encode(&event) {
                    Ok(text) => {
                        if send_text(&mut ws, text).await.is_err() {
                            break PumpExit::SocketError;
                        }
                    }
                    Err(e) => warn!(event = event.name(), error = %e, "failed to encode event"),
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > deadline {
                    info!(silent_secs = last_seen.elapsed().as_secs(), "heartbeat timeout");
                    break PumpExit::HeartbeatTimeout;
                }
                if ws.send(framing.heartbeat()).await.is_err() {
                    break PumpExit::SocketError;
                }
            }

            _ = shutdown.recv() => {
                if let Some(text) = framing.farewell() {
                    let _ = send_text(&mut ws, text).await;
                }
                break PumpExit::Shutdown;
            }
        }
    };

    drop(inbound);
    let _ = ws.close(None).await;
    exit
}

/// Run an activated connection to completion: the gateway loop and the
/// socket pump side by side.
pub async fn drive<F: Framing>(
    gateway: &Gateway,
    conn: Connection,
    ws: WsStream,
    framing: F,
    outbound: mpsc::Receiver<ServerEvent>,
    shutdown: broadcast::Receiver<()>,
    settings: &TransportSettings,
) {
    let conn_id = conn.id;
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (reason, exit) = tokio::join!(
        gateway.run(conn, inbound_rx),
        pump(ws, framing, outbound, inbound_tx, shutdown, settings),
    );
    debug!(conn_id, ?reason, ?exit, "socket finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_socket_route_requires_engine_v4_websocket() {
        assert_eq!(
            route("/socket.io/", Some("EIO=4&transport=websocket&token=abc")),
            Ok(Route::EventSocket {
                token: Some("abc".into())
            })
        );
        assert_eq!(
            route("/socket.io/", Some("EIO=4&transport=websocket")),
            Ok(Route::EventSocket { token: None })
        );
        assert_eq!(
            route("/socket.io/", Some("EIO=3&transport=websocket")).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            route("/socket.io/", Some("EIO=4&transport=polling")).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn plain_routes_and_unknown_paths() {
        assert_eq!(
            route("/ws", Some("token=t1")),
            Ok(Route::PlainSocket {
                token: Some("t1".into())
            })
        );
        assert_eq!(route("/", None), Ok(Route::PlainSocket { token: None }));
        assert_eq!(route("/admin", None).unwrap_err().0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn query_params() {
        assert_eq!(query_param(Some("a=1&b=2"), "b"), Some("2"));
        assert_eq!(query_param(Some("a=1&a=2"), "a"), Some("1"));
        assert_eq!(query_param(Some("flag&token="), "token"), None);
        assert_eq!(query_param(Some("flag"), "flag"), None);
        assert_eq!(query_param(None, "token"), None);
    }
}
