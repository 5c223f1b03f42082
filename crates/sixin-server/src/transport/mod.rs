//! Client transports: the event socket and the plain socket share one TCP
//! listener, and the STUN responder runs on its own UDP port.

pub mod event_socket;
pub mod plain_socket;
pub mod stun;
pub mod websocket;

pub use stun::StunResponder;

use crate::gateway::Gateway;
use sixin_core::SixinResult;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use websocket::Route;

/// Socket-level timing and size limits.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Time allowed between the upgrade and the client's connect packet.
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: 1_048_576,
        }
    }
}

/// Upgrade an accepted TCP stream and serve it on the transport its path
/// selects.
pub async fn serve_stream(
    gateway: &Gateway,
    stream: TcpStream,
    remote: SocketAddr,
    settings: &TransportSettings,
    shutdown: broadcast::Receiver<()>,
) -> SixinResult<()> {
    let (ws, route) = websocket::accept(stream, settings.handshake_timeout).await?;
    match route {
        Route::EventSocket { token } => {
            event_socket::serve(gateway, ws, remote, token, settings, shutdown).await
        }
        Route::PlainSocket { token } => {
            plain_socket::serve(gateway, ws, remote, token, settings, shutdown).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Authenticator, TokenAuthenticator};
    use crate::fanout::FanoutDispatcher;
    use crate::peer::manager::tests::FakeConnector;
    use crate::peer::{PeerConnectionManager, PeerConnector};
    use crate::registry::SessionRegistry;
    use crate::store::MemoryStore;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        auth: Arc<TokenAuthenticator>,
        registry: Arc<SessionRegistry>,
        shutdown: broadcast::Sender<()>,
    }

    async fn start(settings: TransportSettings) -> TestServer {
        let registry = Arc::new(SessionRegistry::new());
        let peers = Arc::new(PeerConnectionManager::new(
            Arc::new(FakeConnector::default()) as Arc<dyn PeerConnector>
        ));
        let fanout = Arc::new(FanoutDispatcher::new(Arc::clone(&registry), 4));
        let auth = Arc::new(TokenAuthenticator::new(sixin_core::generate_secret(), 3600));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&registry),
            peers,
            fanout,
            Arc::new(MemoryStore::new()),
            Arc::clone(&auth) as Arc<dyn Authenticator>,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(1);
        let shutdown_tx = shutdown.clone();
        tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                let gateway = Arc::clone(&gateway);
                let settings = settings.clone();
                let rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let _ = serve_stream(&gateway, stream, remote, &settings, rx).await;
                });
            }
        });

        TestServer {
            addr,
            auth,
            registry,
            shutdown,
        }
    }

    async fn next_text(ws: &mut Client) -> Option<String> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .ok()??;
            match frame.ok()? {
                Message::Text(text) => return Some(text.as_str().to_string()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut Client, text: &str) {
        ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    fn event_of(frame: &str) -> (String, Value) {
        let body = frame.strip_prefix("42").expect("socket event frame");
        let mut array: Vec<Value> = serde_json::from_str(body).unwrap();
        let name = array.remove(0).as_str().unwrap().to_string();
        (name, array.pop().unwrap_or(Value::Null))
    }

    async fn wait_online(server: &TestServer, user: u64) {
        for _ in 0..100 {
            if server.registry.is_online(user).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("user {user} never came online");
    }

    #[tokio::test]
    async fn event_socket_handshake_snapshot_and_events() {
        let server = start(TransportSettings::default()).await;
        let url = format!("ws://{}/socket.io/?EIO=4&transport=websocket", server.addr);
        let (mut ws, _) = connect_async(url).await.unwrap();

        let open = next_text(&mut ws).await.unwrap();
        let handshake: Value = serde_json::from_str(open.strip_prefix('0').unwrap()).unwrap();
        assert_eq!(handshake["pingInterval"], 25000);
        assert_eq!(handshake["pingTimeout"], 20000);
        let sid = handshake["sid"].as_str().unwrap().to_string();

        let token = server.auth.issue(11);
        send(&mut ws, &format!("40{}", json!({ "token": token }))).await;

        let ack = next_text(&mut ws).await.unwrap();
        assert_eq!(ack, format!("40{}", json!({ "sid": sid })));

        let names: Vec<String> = [
            next_text(&mut ws).await.unwrap(),
            next_text(&mut ws).await.unwrap(),
            next_text(&mut ws).await.unwrap(),
        ]
        .iter()
        .map(|f| event_of(f).0)
        .collect();
        assert_eq!(names, ["receive", "email", "self"]);

        send(&mut ws, r#"42["receive"]"#).await;
        let (name, payload) = event_of(&next_text(&mut ws).await.unwrap());
        assert_eq!(name, "receive");
        assert_eq!(payload, json!(false));

        // Engine-level ping from the client is answered by the transport.
        send(&mut ws, "2").await;
        assert_eq!(next_text(&mut ws).await.unwrap(), "3");

        send(&mut ws, r#"42["bogus"]"#).await;
        let (name, payload) = event_of(&next_text(&mut ws).await.unwrap());
        assert_eq!(name, "error");
        assert!(payload.as_str().unwrap().contains("unknown event"));
    }

    #[tokio::test]
    async fn event_socket_bad_token_is_rejected_and_closed() {
        let server = start(TransportSettings::default()).await;
        let url = format!(
            "ws://{}/socket.io/?EIO=4&transport=websocket&token=deadbeef",
            server.addr
        );
        let (mut ws, _) = connect_async(url).await.unwrap();
        next_text(&mut ws).await.unwrap();
        send(&mut ws, "40").await;

        let (name, _) = event_of(&next_text(&mut ws).await.unwrap());
        assert_eq!(name, "error");
        let connect_error = next_text(&mut ws).await.unwrap();
        assert!(connect_error.starts_with("44"));
        assert!(next_text(&mut ws).await.is_none());
        assert_eq!(server.registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn plain_socket_delivers_between_users() {
        let server = start(TransportSettings::default()).await;

        let alice_url = format!("ws://{}/ws?token={}", server.addr, server.auth.issue(1));
        let bob_url = format!("ws://{}/ws?token={}", server.addr, server.auth.issue(2));
        let (mut alice, _) = connect_async(alice_url).await.unwrap();
        let (mut bob, _) = connect_async(bob_url).await.unwrap();
        for ws in [&mut alice, &mut bob] {
            for _ in 0..3 {
                next_text(ws).await.unwrap();
            }
        }
        wait_online(&server, 2).await;

        let frame = json!({
            "type": "message",
            "data": { "listenerId": 2, "text": { "content": "yo" } }
        });
        send(&mut alice, &frame.to_string()).await;

        for ws in [&mut alice, &mut bob] {
            let envelope: Value = serde_json::from_str(&next_text(ws).await.unwrap()).unwrap();
            assert_eq!(envelope["type"], "message");
            assert_eq!(envelope["data"]["talkerId"], 1);
            assert_eq!(envelope["data"]["text"]["content"], "yo");
        }
    }

    #[tokio::test]
    async fn plain_socket_without_token_gets_error_then_close() {
        let server = start(TransportSettings::default()).await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr)).await.unwrap();
        let envelope: Value = serde_json::from_str(&next_text(&mut ws).await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "error");
        assert!(next_text(&mut ws).await.is_none());
    }

    #[tokio::test]
    async fn unknown_path_is_refused() {
        let server = start(TransportSettings::default()).await;
        assert!(connect_async(format!("ws://{}/admin", server.addr)).await.is_err());
    }

    #[tokio::test]
    async fn stalled_upgrade_is_dropped() {
        use tokio::io::AsyncReadExt;

        let settings = TransportSettings {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let server = start(settings).await;
        let mut raw = TcpStream::connect(server.addr).await.unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf))
            .await
            .expect("server kept a silent client open");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_socket() {
        let settings = TransportSettings {
            max_frame_size: 64,
            ..Default::default()
        };
        let server = start(settings).await;
        let url = format!("ws://{}/ws?token={}", server.addr, server.auth.issue(3));
        let (mut ws, _) = connect_async(url).await.unwrap();
        for _ in 0..3 {
            next_text(&mut ws).await.unwrap();
        }
        wait_online(&server, 3).await;

        send(&mut ws, &"x".repeat(65)).await;
        assert!(next_text(&mut ws).await.is_none());
        for _ in 0..100 {
            if !server.registry.is_online(3).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was not unregistered");
    }

    #[tokio::test]
    async fn shutdown_sends_disconnect_to_event_socket_clients() {
        let server = start(TransportSettings::default()).await;
        let url = format!(
            "ws://{}/socket.io/?EIO=4&transport=websocket&token={}",
            server.addr,
            server.auth.issue(4)
        );
        let (mut ws, _) = connect_async(url).await.unwrap();
        next_text(&mut ws).await.unwrap();
        send(&mut ws, "40").await;
        for _ in 0..4 {
            next_text(&mut ws).await.unwrap();
        }
        wait_online(&server, 4).await;

        server.shutdown.send(()).unwrap();
        assert_eq!(next_text(&mut ws).await.as_deref(), Some("41"));
        assert!(next_text(&mut ws).await.is_none());
    }
}
