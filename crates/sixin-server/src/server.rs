//! Core server: wires the subsystems together and accepts connections.
//!
//! Owns the session registry, peer manager, fanout dispatcher and gateway,
//! runs the STUN responder alongside the WebSocket listener, and
//! coordinates shutdown for every live connection.

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::fanout::FanoutDispatcher;
use crate::gateway::{Gateway, MessageSealer};
use crate::peer::{PeerConnectionManager, WebRtcConnector};
use crate::registry::SessionRegistry;
use crate::store::{MemoryStore, Store};
use crate::transport::{self, StunResponder, TransportSettings};
use sixin_core::{SixinError, SixinResult};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Interval of the housekeeping task.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// How long `run` waits for live connections to drain after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// The sixin server instance.
pub struct SixinServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    settings: TransportSettings,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl SixinServer {
    pub fn new(config: ServerConfig) -> SixinResult<Self> {
        let registry = Arc::new(SessionRegistry::new());

        let connector = WebRtcConnector::new(config.ice_servers.clone(), config.gather_timeout)?;
        let peers = Arc::new(PeerConnectionManager::new(Arc::new(connector)));

        let fanout = Arc::new(FanoutDispatcher::new(
            Arc::clone(&registry),
            config.fanout_workers,
        ));
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let authenticator: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(
            config.token_secret.clone(),
            config.token_ttl,
        ));

        let mut gateway = Gateway::new(registry, peers, fanout, store, authenticator)
            .with_idle_timeout(config.idle_timeout)
            .with_handler_timeout(config.handler_timeout);
        if let Some(key) = &config.at_rest_key {
            info!("message bodies are sealed at rest");
            gateway = gateway.with_sealer(MessageSealer::new(key.clone()));
        }

        let settings = TransportSettings {
            max_frame_size: config.max_frame_size,
            ..Default::default()
        };

        Ok(Self {
            config,
            gateway: Arc::new(gateway),
            settings,
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Sender that stops the listeners and every live connection.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until a shutdown is broadcast.
    pub async fn run(self) -> SixinResult<()> {
        let server = Arc::new(self);

        let ws_addr = server.bind_addr(server.config.port)?;
        let stun_addr = server.bind_addr(server.config.stun_port)?;

        let listener = TcpListener::bind(ws_addr)
            .await
            .map_err(|e| SixinError::Transport(format!("WS bind failed: {e}")))?;
        let stun = StunResponder::bind(stun_addr, server.config.stun_workers).await?;
        tokio::spawn(stun.run(server.shutdown_tx.subscribe()));

        // Housekeeping
        let gc_gateway = Arc::clone(&server.gateway);
        let mut gc_shutdown = server.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gc_gateway.gc().await;
                        let online = gc_gateway.registry().connection_count().await;
                        debug!(online, "housekeeping");
                    }
                    _ = gc_shutdown.recv() => break,
                }
            }
        });

        info!(
            ws = %ws_addr,
            stun = %stun_addr,
            idle_timeout_secs = server.config.idle_timeout.as_secs(),
            "sixin-server ready"
        );

        let mut shutdown_rx = server.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let srv = Arc::clone(&server);
                        let conn_shutdown = srv.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) = transport::serve_stream(
                                &srv.gateway,
                                stream,
                                remote,
                                &srv.settings,
                                conn_shutdown,
                            )
                            .await
                            {
                                warn!(%remote, error = %e, "WebSocket connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        server.drain().await;
        Ok(())
    }

    /// Wait for connections to unregister, up to [`SHUTDOWN_GRACE`].
    async fn drain(&self) {
        let registry = self.gateway.registry();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let remaining = registry.connection_count().await;
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "connections still open after shutdown grace period");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn bind_addr(&self, port: u16) -> SixinResult<SocketAddr> {
        let ip: IpAddr = self
            .config
            .host
            .parse()
            .map_err(|e| SixinError::Other(format!("invalid host {:?}: {e}", self.config.host)))?;
        Ok(SocketAddr::new(ip, port))
    }
}
