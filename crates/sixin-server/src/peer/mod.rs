//! Server-side WebRTC peer connections.
//!
//! [`PeerConnectionManager`] owns the negotiation state per connection.
//! The peer-connection primitive itself sits behind [`PeerConnector`] /
//! [`PeerLink`] so the state machine can be driven without a media stack.

pub mod manager;
pub mod webrtc;

pub use manager::PeerConnectionManager;
pub use webrtc::WebRtcConnector;

use async_trait::async_trait;
use sixin_core::{IceCandidateInit, SessionDescription, SixinResult};
use std::sync::Arc;

use crate::registry::ConnectionId;

/// Creates peer-connection primitives.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, conn_id: ConnectionId) -> SixinResult<Arc<dyn PeerLink>>;
}

/// One underlying peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Apply `offer` as the remote description, then create, apply and
    /// return the local answer.
    async fn accept_offer(&self, offer: &SessionDescription) -> SixinResult<SessionDescription>;

    /// Apply a remote answer.
    async fn apply_answer(&self, answer: &SessionDescription) -> SixinResult<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> SixinResult<()>;

    async fn close(&self) -> SixinResult<()>;
}
