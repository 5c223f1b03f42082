//! UDP STUN responder.
//!
//! Answers RFC 5389 Binding requests with the sender's reflexive address.
//! Anything else arriving on the port is dropped without a reply.

use sixin_core::stun::{self, StunMessage};
use sixin_core::{SixinError, SixinResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, trace, warn};

/// Largest datagram we read; STUN requests from browsers are far smaller.
const MAX_DATAGRAM: usize = 1500;

/// Upper bound on handling a single datagram.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct StunResponder {
    socket: Arc<UdpSocket>,
    workers: Arc<Semaphore>,
}

impl StunResponder {
    pub async fn bind(addr: SocketAddr, workers: usize) -> SixinResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| SixinError::Transport(format!("STUN bind failed: {e}")))?;
        Ok(Self {
            socket: Arc::new(socket),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        })
    }

    pub fn local_addr(&self) -> SixinResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `shutdown` fires.
    ///
    /// Each request is answered on its own task; at most `workers` are in
    /// flight and the receive loop waits for a free slot.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let addr = self.socket.local_addr().ok();
        info!(?addr, "STUN responder started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            let (len, from) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "STUN recv failed");
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };

            let datagram = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            tokio::spawn(async move {
                let _permit = permit;
                if tokio::time::timeout(RESPONSE_TIMEOUT, respond(&socket, &datagram, from))
                    .await
                    .is_err()
                {
                    debug!(%from, "STUN response timed out");
                }
            });
        }

        info!("STUN responder stopped");
    }
}

async fn respond(socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
    if !stun::is_stun_message(datagram) {
        trace!(%from, len = datagram.len(), "ignoring non-STUN datagram");
        return;
    }
    let request = match StunMessage::decode(datagram) {
        Ok(m) => m,
        Err(e) => {
            debug!(%from, error = %e, "malformed STUN message");
            return;
        }
    };
    if !request.is_binding_request() {
        trace!(%from, msg_type = request.msg_type, "ignoring non-binding STUN message");
        return;
    }

    let response = stun::build_binding_response(&request.transaction_id, from);
    match socket.send_to(&response, from).await {
        Ok(_) => debug!(%from, "STUN binding answered"),
        Err(e) => warn!(%from, error = %e, "STUN send failed"),
    }
}
