//! Offer/answer/ICE state machine, one session per connection.
//!
//! The table lock is held only to look up or mutate an entry. SDP work runs
//! outside it: an offer first reserves the slot as pending, negotiates, then
//! promotes the slot if it still holds the same reservation. The reservation
//! is released when the offer future is dropped midway, so a cancelled
//! negotiation never leaves a pending slot or an open link behind.

use super::{PeerConnector, PeerLink};
use crate::registry::ConnectionId;
use sixin_core::{IceCandidateInit, SessionDescription, SixinError, SixinResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Negotiation state of a connection's peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

struct PeerSession {
    link: Arc<dyn PeerLink>,
    state: PeerState,
    remote: SessionDescription,
    candidates: Vec<IceCandidateInit>,
}

enum Slot {
    /// Offer accepted, answer not yet produced. Candidates that arrive in
    /// the meantime are queued and applied once the session is ready.
    Pending {
        ticket: u64,
        queued: Vec<IceCandidateInit>,
    },
    Ready(PeerSession),
}

impl Slot {
    fn state(&self) -> PeerState {
        match self {
            Slot::Pending { .. } => PeerState::OfferReceived,
            Slot::Ready(session) => session.state,
        }
    }
}

type SessionTable = Arc<Mutex<HashMap<ConnectionId, Slot>>>;

fn remove_if_pending(sessions: &mut HashMap<ConnectionId, Slot>, conn_id: ConnectionId, ticket: u64) {
    if matches!(sessions.get(&conn_id), Some(Slot::Pending { ticket: t, .. }) if *t == ticket) {
        sessions.remove(&conn_id);
    }
}

/// A pending slot held by an in-flight offer.
///
/// Dropped without [`promote`](Reservation::promote) or
/// [`abandon`](Reservation::abandon), it frees the slot and closes the link
/// on a background task.
struct Reservation {
    sessions: SessionTable,
    conn_id: ConnectionId,
    ticket: u64,
    link: Option<Arc<dyn PeerLink>>,
    settled: bool,
}

impl Reservation {
    /// Release the slot if it is still ours and close the link, if any.
    async fn abandon(mut self) {
        self.settled = true;
        remove_if_pending(&mut *self.sessions.lock().await, self.conn_id, self.ticket);
        if let Some(link) = self.link.take() {
            close_quietly(self.conn_id, link.as_ref()).await;
        }
    }

    /// Swap the pending slot for a ready session. Returns the queued
    /// candidates, or `None` when the slot was taken away meanwhile.
    async fn promote(&mut self, remote: SessionDescription) -> Option<Vec<IceCandidateInit>> {
        let link = self.link.as_ref().map(Arc::clone)?;
        let mut sessions = self.sessions.lock().await;
        let queued = match sessions.remove(&self.conn_id) {
            Some(Slot::Pending { ticket, queued }) if ticket == self.ticket => queued,
            Some(other) => {
                sessions.insert(self.conn_id, other);
                return None;
            }
            None => return None,
        };
        sessions.insert(
            self.conn_id,
            Slot::Ready(PeerSession {
                link,
                state: PeerState::AnswerSent,
                remote,
                candidates: queued.clone(),
            }),
        );
        self.settled = true;
        Some(queued)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let (conn_id, ticket) = (self.conn_id, self.ticket);
        let link = self.link.take();
        let released = match self.sessions.try_lock() {
            Ok(mut sessions) => {
                remove_if_pending(&mut sessions, conn_id, ticket);
                true
            }
            Err(_) => false,
        };
        debug!(conn_id, released, "offer abandoned midway");
        if released && link.is_none() {
            return;
        }

        let sessions = Arc::clone(&self.sessions);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if !released {
                        remove_if_pending(&mut *sessions.lock().await, conn_id, ticket);
                    }
                    if let Some(link) = link {
                        close_quietly(conn_id, link.as_ref()).await;
                    }
                });
            }
            Err(_) => warn!(conn_id, "no runtime to release an abandoned offer"),
        }
    }
}

pub struct PeerConnectionManager {
    connector: Arc<dyn PeerConnector>,
    sessions: SessionTable,
    next_ticket: AtomicU64,
}

impl PeerConnectionManager {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Accept a remote offer and return the local answer.
    ///
    /// Rejected while a session already exists for `conn_id`; call
    /// [`cleanup`](Self::cleanup) first to renegotiate from scratch. On any
    /// failure, and when the returned future is dropped before completing,
    /// no session is left behind.
    pub async fn handle_offer(
        &self,
        conn_id: ConnectionId,
        offer: SessionDescription,
    ) -> SixinResult<SessionDescription> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&conn_id) {
                debug!(conn_id, state = ?existing.state(), "re-offer rejected");
                return Err(SixinError::Protocol(
                    "a peer session already exists for this connection".into(),
                ));
            }
            sessions.insert(
                conn_id,
                Slot::Pending {
                    ticket,
                    queued: Vec::new(),
                },
            );
        }
        let mut reservation = Reservation {
            sessions: Arc::clone(&self.sessions),
            conn_id,
            ticket,
            link: None,
            settled: false,
        };

        let link = match self.connector.connect(conn_id).await {
            Ok(link) => link,
            Err(e) => {
                reservation.abandon().await;
                return Err(negotiation(e));
            }
        };
        reservation.link = Some(Arc::clone(&link));

        let answer = match link.accept_offer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                reservation.abandon().await;
                return Err(negotiation(e));
            }
        };

        let Some(queued) = reservation.promote(offer).await else {
            reservation.abandon().await;
            return Err(SixinError::Protocol(
                "connection closed during negotiation".into(),
            ));
        };

        for candidate in &queued {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!(conn_id, error = %e, "queued ICE candidate rejected");
            }
        }

        info!(conn_id, queued = queued.len(), "answer created");
        Ok(answer)
    }

    /// Apply a remote answer to an existing session.
    pub async fn handle_answer(
        &self,
        conn_id: ConnectionId,
        answer: SessionDescription,
    ) -> SixinResult<()> {
        let link = {
            let sessions = self.sessions.lock().await;
            match sessions.get(&conn_id) {
                Some(Slot::Ready(session)) => Arc::clone(&session.link),
                Some(Slot::Pending { .. }) => {
                    return Err(SixinError::Protocol(
                        "answer received while the offer is still being processed".into(),
                    ))
                }
                None => {
                    return Err(SixinError::Protocol(
                        "answer for a connection that was never offered".into(),
                    ))
                }
            }
        };

        link.apply_answer(&answer).await.map_err(negotiation)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(Slot::Ready(session)) = sessions.get_mut(&conn_id) {
            session.remote = answer;
            session.state = PeerState::Connected;
        }
        debug!(conn_id, "remote answer applied");
        Ok(())
    }

    /// Add a trickled ICE candidate.
    pub async fn handle_ice_candidate(
        &self,
        conn_id: ConnectionId,
        candidate: IceCandidateInit,
    ) -> SixinResult<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker.
            return self.ensure_session(conn_id).await;
        }

        let link = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&conn_id) {
                Some(Slot::Ready(session)) => {
                    session.candidates.push(candidate.clone());
                    Arc::clone(&session.link)
                }
                Some(Slot::Pending { queued, .. }) => {
                    queued.push(candidate);
                    return Ok(());
                }
                None => {
                    return Err(SixinError::Protocol(
                        "ICE candidate for a connection with no peer session".into(),
                    ))
                }
            }
        };

        link.add_ice_candidate(&candidate).await.map_err(negotiation)
    }

    /// Close and forget the session for `conn_id`. Idempotent.
    ///
    /// Returns `Closed` when a session was torn down, `Idle` when there was
    /// nothing to close.
    pub async fn cleanup(&self, conn_id: ConnectionId) -> PeerState {
        let removed = self.sessions.lock().await.remove(&conn_id);
        match removed {
            Some(Slot::Ready(session)) => {
                close_quietly(conn_id, session.link.as_ref()).await;
                debug!(conn_id, candidates = session.candidates.len(), "peer session closed");
                PeerState::Closed
            }
            // The in-flight offer notices the missing slot and closes its own link.
            Some(Slot::Pending { .. }) => PeerState::Closed,
            None => PeerState::Idle,
        }
    }

    /// Current negotiation state; `Idle` when no session exists.
    #[cfg(test)]
    pub async fn state(&self, conn_id: ConnectionId) -> PeerState {
        self.sessions
            .lock()
            .await
            .get(&conn_id)
            .map_or(PeerState::Idle, Slot::state)
    }

    #[cfg(test)]
    pub async fn remote_description(&self, conn_id: ConnectionId) -> Option<SessionDescription> {
        match self.sessions.lock().await.get(&conn_id) {
            Some(Slot::Ready(session)) => Some(session.remote.clone()),
            _ => None,
        }
    }

    #[cfg(test)]
    pub async fn candidate_count(&self, conn_id: ConnectionId) -> usize {
        match self.sessions.lock().await.get(&conn_id) {
            Some(Slot::Ready(session)) => session.candidates.len(),
            Some(Slot::Pending { queued, .. }) => queued.len(),
            None => 0,
        }
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn ensure_session(&self, conn_id: ConnectionId) -> SixinResult<()> {
        if self.sessions.lock().await.contains_key(&conn_id) {
            Ok(())
        } else {
            Err(SixinError::Protocol(
                "ICE candidate for a connection with no peer session".into(),
            ))
        }
    }
}

fn negotiation(e: SixinError) -> SixinError {
    match e {
        SixinError::Negotiation(_) => e,
        other => SixinError::Negotiation(other.to_string()),
    }
}

async fn close_quietly(conn_id: ConnectionId, link: &dyn PeerLink) {
    if let Err(e) = link.close().await {
        debug!(conn_id, error = %e, "peer link close failed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use sixin_core::messages::SdpType;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Scripted peer-connection primitive.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub fail_connect: AtomicBool,
        pub fail_offer: AtomicBool,
        pub connects: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub candidates: Arc<AtomicUsize>,
        /// When set, `accept_offer` waits for a notification before answering.
        pub gate: Option<Arc<Notify>>,
    }

    struct FakeLink {
        fail_offer: bool,
        closes: Arc<AtomicUsize>,
        candidates: Arc<AtomicUsize>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(&self, _conn_id: ConnectionId) -> SixinResult<Arc<dyn PeerLink>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(SixinError::Negotiation("no media engine".into()));
            }
            Ok(Arc::new(FakeLink {
                fail_offer: self.fail_offer.load(Ordering::SeqCst),
                closes: Arc::clone(&self.closes),
                candidates: Arc::clone(&self.candidates),
                gate: self.gate.clone(),
            }))
        }
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn accept_offer(&self, offer: &SessionDescription) -> SixinResult<SessionDescription> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_offer || offer.sdp.is_empty() {
                return Err(SixinError::Negotiation("invalid remote description".into()));
            }
            Ok(SessionDescription::answer(format!("answer-to:{}", offer.sdp)))
        }

        async fn apply_answer(&self, _answer: &SessionDescription) -> SixinResult<()> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: &IceCandidateInit) -> SixinResult<()> {
            self.candidates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> SixinResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn candidate(s: &str) -> IceCandidateInit {
        IceCandidateInit {
            candidate: s.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn manager(connector: FakeConnector) -> (PeerConnectionManager, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        (
            PeerConnectionManager::new(Arc::clone(&connector) as Arc<dyn PeerConnector>),
            connector,
        )
    }

    #[tokio::test]
    async fn offer_produces_answer() {
        let (peers, _) = manager(FakeConnector::default());
        let answer = peers
            .handle_offer(1, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(answer.sdp, "answer-to:v=0");
        assert_eq!(peers.state(1).await, PeerState::AnswerSent);
        assert_eq!(peers.remote_description(1).await.unwrap().sdp, "v=0");
    }

    #[tokio::test]
    async fn answer_before_offer_is_a_protocol_error() {
        let (peers, _) = manager(FakeConnector::default());
        let err = peers
            .handle_answer(1, SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SixinError::Protocol(_)));
        assert_eq!(peers.session_count().await, 0);
        assert_eq!(peers.state(1).await, PeerState::Idle);
    }

    #[tokio::test]
    async fn candidate_without_session_is_a_protocol_error() {
        let (peers, _) = manager(FakeConnector::default());
        assert!(matches!(
            peers.handle_ice_candidate(1, candidate("candidate:1")).await,
            Err(SixinError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn second_offer_is_rejected_and_first_session_kept() {
        let (peers, connector) = manager(FakeConnector::default());
        peers
            .handle_offer(1, SessionDescription::offer("first"))
            .await
            .unwrap();
        let err = peers
            .handle_offer(1, SessionDescription::offer("second"))
            .await
            .unwrap_err();
        assert!(matches!(err, SixinError::Protocol(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(peers.remote_description(1).await.unwrap().sdp, "first");

        // After cleanup a fresh offer is accepted.
        assert_eq!(peers.cleanup(1).await, PeerState::Closed);
        peers
            .handle_offer(1, SessionDescription::offer("third"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_negotiation_leaves_no_session() {
        let connector = FakeConnector::default();
        connector.fail_offer.store(true, Ordering::SeqCst);
        let (peers, connector) = manager(connector);

        let err = peers
            .handle_offer(1, SessionDescription::offer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SixinError::Negotiation(_)));
        assert_eq!(peers.session_count().await, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        connector.fail_offer.store(false, Ordering::SeqCst);
        connector.fail_connect.store(true, Ordering::SeqCst);
        assert!(peers
            .handle_offer(1, SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert_eq!(peers.session_count().await, 0);
    }

    #[tokio::test]
    async fn full_negotiation_with_candidates() {
        let (peers, connector) = manager(FakeConnector::default());
        peers
            .handle_offer(1, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        peers
            .handle_ice_candidate(1, candidate("candidate:1"))
            .await
            .unwrap();
        peers
            .handle_ice_candidate(1, candidate("candidate:2"))
            .await
            .unwrap();
        peers.handle_ice_candidate(1, candidate("")).await.unwrap();
        assert_eq!(peers.candidate_count(1).await, 2);
        assert_eq!(connector.candidates.load(Ordering::SeqCst), 2);

        peers
            .handle_answer(1, SessionDescription::answer("v=0"))
            .await
            .unwrap();
        assert_eq!(peers.state(1).await, PeerState::Connected);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (peers, connector) = manager(FakeConnector::default());
        assert_eq!(peers.cleanup(1).await, PeerState::Idle);
        peers
            .handle_offer(1, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(peers.cleanup(1).await, PeerState::Closed);
        assert_eq!(peers.cleanup(1).await, PeerState::Idle);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
        assert_eq!(peers.state(1).await, PeerState::Idle);
    }

    #[tokio::test]
    async fn candidates_queue_while_offer_is_pending_and_cleanup_aborts_it() {
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let (peers, connector) = manager(connector);
        let peers = Arc::new(peers);

        let offer_task = {
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                peers
                    .handle_offer(1, SessionDescription::offer("v=0"))
                    .await
            })
        };
        while peers.state(1).await != PeerState::OfferReceived {
            tokio::task::yield_now().await;
        }

        peers
            .handle_ice_candidate(1, candidate("candidate:early"))
            .await
            .unwrap();
        assert_eq!(peers.candidate_count(1).await, 1);

        // Disconnect while the answer is being generated.
        assert_eq!(peers.cleanup(1).await, PeerState::Closed);
        gate.notify_one();

        let result = offer_task.await.unwrap();
        assert!(matches!(result, Err(SixinError::Protocol(_))));
        assert_eq!(peers.session_count().await, 0);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queued_candidates_are_applied_once_ready() {
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let (peers, connector) = manager(connector);
        let peers = Arc::new(peers);

        let offer_task = {
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                peers
                    .handle_offer(1, SessionDescription::offer("v=0"))
                    .await
            })
        };
        while peers.state(1).await != PeerState::OfferReceived {
            tokio::task::yield_now().await;
        }
        peers
            .handle_ice_candidate(1, candidate("candidate:early"))
            .await
            .unwrap();
        gate.notify_one();

        offer_task.await.unwrap().unwrap();
        assert_eq!(connector.candidates.load(Ordering::SeqCst), 1);
        assert_eq!(peers.candidate_count(1).await, 1);
    }

    #[tokio::test]
    async fn dropped_offer_releases_its_slot_and_link() {
        let gate = Arc::new(Notify::new());
        let connector = FakeConnector {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let (peers, connector) = manager(connector);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            peers.handle_offer(1, SessionDescription::offer("v=0")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(peers.state(1).await, PeerState::Idle);

        for _ in 0..100 {
            if connector.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        // Stored permit lets the retry answer straight away.
        gate.notify_one();
        let answer = peers
            .handle_offer(1, SessionDescription::offer("v=1"))
            .await
            .unwrap();
        assert_eq!(answer.sdp, "answer-to:v=1");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
