//! [`PeerConnector`] backed by the `webrtc` crate.

use super::{PeerConnector, PeerLink};
use crate::registry::ConnectionId;
use async_trait::async_trait;
use sixin_core::messages::SdpType;
use sixin_core::{IceCandidateInit, SessionDescription, SixinError, SixinResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn rtc_err(e: webrtc::Error) -> SixinError {
    SixinError::Negotiation(e.to_string())
}

pub struct WebRtcConnector {
    api: API,
    config: RTCConfiguration,
    gather_timeout: Duration,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>, gather_timeout: Duration) -> SixinResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers,
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            gather_timeout,
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, conn_id: ConnectionId) -> SixinResult<Arc<dyn PeerLink>> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(rtc_err)?;

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            Box::pin(async move {
                match state {
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected => {
                        warn!(conn_id, %state, "ICE connection state changed")
                    }
                    _ => info!(conn_id, %state, "ICE connection state changed"),
                }
            })
        }));

        Ok(Arc::new(WebRtcLink {
            conn_id,
            pc: Arc::new(pc),
            gather_timeout: self.gather_timeout,
        }))
    }
}

struct WebRtcLink {
    conn_id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
}

fn to_rtc(desc: &SessionDescription) -> SixinResult<RTCSessionDescription> {
    let sdp = desc.sdp.clone();
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(SixinError::Protocol("rollback is not supported".into()))
        }
    }
    .map_err(rtc_err)
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn accept_offer(&self, offer: &SessionDescription) -> SixinResult<SessionDescription> {
        self.pc
            .set_remote_description(to_rtc(offer)?)
            .await
            .map_err(rtc_err)?;

        let answer = self.pc.create_answer(None).await.map_err(rtc_err)?;
        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(rtc_err)?;

        // Embed server candidates in the answer; fall back to whatever has
        // been gathered once the timeout expires.
        if tokio::time::timeout(self.gather_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            debug!(conn_id = self.conn_id, "ICE gathering timed out, answering with partial candidates");
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SixinError::Negotiation("no local description after gathering".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> SixinResult<()> {
        self.pc
            .set_remote_description(to_rtc(answer)?)
            .await
            .map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> SixinResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    async fn close(&self) -> SixinResult<()> {
        self.pc.close().await.map_err(rtc_err)
    }
}
