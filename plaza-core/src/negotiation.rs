//! Per-remote-peer offer/answer state machine.
//!
//! The orchestrator owns one [`PeerConnection`] per remote peer and turns
//! signaling input and media-engine callbacks into outgoing signals. It
//! performs no I/O itself: the caller ships every returned
//! [`OutgoingSignal`] over the signaling transport.
//!
//! ```text
//!              on_peer_joined / first offer
//!   None ─────────────────────────────────────▸ Connecting
//!                                                   │ transport Connected
//!                                                   ▼
//!                                               Connected
//!                                      transport Failed │ peer-left / close
//!                                                   ▼
//!                                          Failed | Closed
//! ```
//!
//! Glare: when an offer arrives while our own offer is in flight, the peer
//! whose id sorts lower is polite. It rolls back and answers. The impolite
//! side ignores the incoming offer and waits for its own answer.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::classifier::{RemoteTrack, TrackKind};
use crate::PeerId;

/// ICE candidate as carried in a `signal` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Body of a `signal` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingSignal {
    pub to: PeerId,
    pub signal: SignalPayload,
}

/// A local media track to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
}

/// Handle returned by [`PeerConnection::add_track`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MediaError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Media engine failed for peer {peer}: {source}")]
    Media {
        peer: PeerId,
        #[source]
        source: MediaError,
    },

    #[error("No connection to peer {0}")]
    UnknownPeer(PeerId),
}

/// One direct media connection, as exposed by the platform media stack.
pub trait PeerConnection {
    fn create_offer(&mut self) -> Result<String, MediaError>;
    fn create_answer(&mut self) -> Result<String, MediaError>;
    fn set_local_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;
    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;
    /// Discard a local offer that has not been answered.
    fn rollback(&mut self) -> Result<(), MediaError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError>;
    fn add_track(&mut self, track: &LocalTrack) -> Result<SenderId, MediaError>;
    fn remove_track(&mut self, sender: SenderId) -> Result<(), MediaError>;
    fn close(&mut self);
}

/// Factory for peer connections plus control of local capture.
pub trait MediaEngine {
    type Connection: PeerConnection;

    fn create_connection(&mut self, remote: &str) -> Result<Self::Connection, MediaError>;

    /// Stop every local capture track (camera, microphone, screens).
    fn stop_local_tracks(&mut self);
}

/// Connectivity reported by the media engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaEventKind {
    LocalCandidate(IceCandidate),
    StateChanged(TransportStatus),
    Track(RemoteTrack),
}

/// Callback from the media engine, tagged with the remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaEvent {
    pub remote: PeerId,
    pub kind: MediaEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    None,
    Connecting,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// What a media event means for the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Ignored,
    Signal(OutgoingSignal),
    StateChanged { peer_id: PeerId, state: PeerState },
    Track { peer_id: PeerId, track: RemoteTrack },
}

struct Link<C> {
    conn: C,
    state: PeerState,
    signaling: SignalingState,
    has_remote_description: bool,
    pending_candidates: Vec<IceCandidate>,
    webcam_senders: Vec<SenderId>,
    share_senders: HashMap<String, Vec<SenderId>>,
    negotiation_needed: bool,
}

impl<C: PeerConnection> Link<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            state: PeerState::Connecting,
            signaling: SignalingState::Stable,
            has_remote_description: false,
            pending_candidates: Vec::new(),
            webcam_senders: Vec::new(),
            share_senders: HashMap::new(),
            negotiation_needed: false,
        }
    }

    fn offer(&mut self, remote: &str) -> Result<OutgoingSignal, MediaError> {
        let sdp = self.conn.create_offer()?;
        self.conn.set_local_description(SdpKind::Offer, &sdp)?;
        self.signaling = SignalingState::HaveLocalOffer;
        self.negotiation_needed = false;
        Ok(OutgoingSignal {
            to: remote.to_string(),
            signal: SignalPayload::Offer { sdp },
        })
    }

    fn flush_candidates(&mut self, remote: &str) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.conn.add_ice_candidate(&candidate) {
                log::debug!("Dropping candidate from {}: {}", remote, e);
            }
        }
    }

    /// Offer again if a track change happened mid-negotiation.
    fn follow_up(&mut self, remote: &str) -> Result<Option<OutgoingSignal>, MediaError> {
        if self.negotiation_needed && self.signaling == SignalingState::Stable {
            return self.offer(remote).map(Some);
        }
        Ok(None)
    }
}

pub struct PeerOrchestrator<E: MediaEngine> {
    local_id: PeerId,
    engine: E,
    links: HashMap<PeerId, Link<E::Connection>>,
    /// Terminal states of links that have been torn down.
    finished: HashMap<PeerId, PeerState>,
    webcam: Vec<LocalTrack>,
    shares: BTreeMap<String, Vec<LocalTrack>>,
}

impl<E: MediaEngine> PeerOrchestrator<E> {
    pub fn new(local_id: impl Into<PeerId>, engine: E) -> Self {
        Self {
            local_id: local_id.into(),
            engine,
            links: HashMap::new(),
            finished: HashMap::new(),
            webcam: Vec::new(),
            shares: BTreeMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn state(&self, peer_id: &str) -> PeerState {
        if let Some(link) = self.links.get(peer_id) {
            return link.state;
        }
        self.finished.get(peer_id).copied().unwrap_or(PeerState::None)
    }

    pub fn signaling_state(&self, peer_id: &str) -> Option<SignalingState> {
        self.links.get(peer_id).map(|l| l.signaling)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The lower id is polite.
    pub fn is_polite_towards(&self, remote: &str) -> bool {
        self.local_id.as_str() < remote
    }

    fn media_error(peer: &str, source: MediaError) -> NegotiationError {
        NegotiationError::Media {
            peer: peer.to_string(),
            source,
        }
    }

    /// Create a link with every active local track attached.
    fn open_link(&mut self, remote: &str) -> Result<(), MediaError> {
        let conn = self.engine.create_connection(remote)?;
        let mut link = Link::new(conn);
        for track in &self.webcam {
            let sender = link.conn.add_track(track)?;
            link.webcam_senders.push(sender);
        }
        for (share_id, tracks) in &self.shares {
            for track in tracks {
                let sender = link.conn.add_track(track)?;
                link.share_senders.entry(share_id.clone()).or_default().push(sender);
            }
        }
        self.finished.remove(remote);
        self.links.insert(remote.to_string(), link);
        Ok(())
    }

    fn fail_link(&mut self, remote: &str) {
        if let Some(mut link) = self.links.remove(remote) {
            link.conn.close();
        }
        self.finished.insert(remote.to_string(), PeerState::Failed);
    }

    /// A peer joined after us: we initiate.
    pub fn on_peer_joined(&mut self, remote: &str) -> Result<Vec<OutgoingSignal>, NegotiationError> {
        if remote == self.local_id {
            return Ok(Vec::new());
        }
        if let Some(mut stale) = self.links.remove(remote) {
            stale.conn.close();
        }

        let result = self.open_link(remote).and_then(|_| match self.links.get_mut(remote) {
            Some(link) => link.offer(remote),
            None => Err(MediaError("link vanished".into())),
        });
        match result {
            Ok(offer) => {
                log::debug!("Offering to {}", remote);
                Ok(vec![offer])
            }
            Err(e) => {
                self.fail_link(remote);
                Err(Self::media_error(remote, e))
            }
        }
    }

    /// Handle an inbound `signal` from `from`.
    pub fn on_signal(
        &mut self,
        from: &str,
        payload: SignalPayload,
    ) -> Result<Vec<OutgoingSignal>, NegotiationError> {
        match payload {
            SignalPayload::Offer { sdp } => self.on_offer(from, &sdp),
            SignalPayload::Answer { sdp } => self.on_answer(from, &sdp),
            SignalPayload::Candidate { candidate } => {
                self.on_candidate(from, candidate);
                Ok(Vec::new())
            }
        }
    }

    fn on_offer(&mut self, from: &str, sdp: &str) -> Result<Vec<OutgoingSignal>, NegotiationError> {
        if !self.links.contains_key(from) {
            if let Err(e) = self.open_link(from) {
                self.fail_link(from);
                return Err(Self::media_error(from, e));
            }
        }
        let polite = self.is_polite_towards(from);
        let Some(link) = self.links.get_mut(from) else {
            return Err(NegotiationError::UnknownPeer(from.to_string()));
        };

        let result = (|| -> Result<Vec<OutgoingSignal>, MediaError> {
            if link.signaling == SignalingState::HaveLocalOffer {
                if !polite {
                    log::debug!("Glare with {}: impolite, ignoring their offer", from);
                    return Ok(Vec::new());
                }
                log::debug!("Glare with {}: polite, rolling back our offer", from);
                link.conn.rollback()?;
                link.signaling = SignalingState::Stable;
                // An answer cannot add our tracks; offer again once stable.
                link.negotiation_needed = true;
            }

            link.conn.set_remote_description(SdpKind::Offer, sdp)?;
            link.signaling = SignalingState::HaveRemoteOffer;
            link.has_remote_description = true;
            link.flush_candidates(from);

            let answer = link.conn.create_answer()?;
            link.conn.set_local_description(SdpKind::Answer, &answer)?;
            link.signaling = SignalingState::Stable;

            let mut out = vec![OutgoingSignal {
                to: from.to_string(),
                signal: SignalPayload::Answer { sdp: answer },
            }];
            out.extend(link.follow_up(from)?);
            Ok(out)
        })();

        result.map_err(|e| {
            self.fail_link(from);
            Self::media_error(from, e)
        })
    }

    fn on_answer(&mut self, from: &str, sdp: &str) -> Result<Vec<OutgoingSignal>, NegotiationError> {
        let Some(link) = self.links.get_mut(from) else {
            log::debug!("Answer from {} without a connection, dropping", from);
            return Ok(Vec::new());
        };
        if link.signaling != SignalingState::HaveLocalOffer {
            log::debug!("Stale answer from {} in {:?}, dropping", from, link.signaling);
            return Ok(Vec::new());
        }

        let result = (|| -> Result<Vec<OutgoingSignal>, MediaError> {
            link.conn.set_remote_description(SdpKind::Answer, sdp)?;
            link.signaling = SignalingState::Stable;
            link.has_remote_description = true;
            link.flush_candidates(from);
            Ok(link.follow_up(from)?.into_iter().collect())
        })();

        result.map_err(|e| {
            self.fail_link(from);
            Self::media_error(from, e)
        })
    }

    fn on_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let Some(link) = self.links.get_mut(from) else {
            log::debug!("Candidate from {} before any offer, dropping", from);
            return;
        };
        if !link.has_remote_description {
            link.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = link.conn.add_ice_candidate(&candidate) {
            log::debug!("Dropping candidate from {}: {}", from, e);
        }
    }

    /// Translate a media-engine callback.
    pub fn handle_media_event(&mut self, event: MediaEvent) -> NegotiationOutcome {
        let MediaEvent { remote, kind } = event;
        if !self.links.contains_key(&remote) {
            log::trace!("Media event for unknown peer {}", remote);
            return NegotiationOutcome::Ignored;
        }

        match kind {
            MediaEventKind::LocalCandidate(candidate) => NegotiationOutcome::Signal(OutgoingSignal {
                to: remote,
                signal: SignalPayload::Candidate { candidate },
            }),
            MediaEventKind::Track(track) => NegotiationOutcome::Track {
                peer_id: remote,
                track,
            },
            MediaEventKind::StateChanged(status) => {
                let state = match status {
                    TransportStatus::Checking => PeerState::Connecting,
                    TransportStatus::Connected => PeerState::Connected,
                    TransportStatus::Disconnected => {
                        // Transient; ICE may recover on its own.
                        log::debug!("Transport to {} disconnected", remote);
                        return NegotiationOutcome::Ignored;
                    }
                    TransportStatus::Failed => {
                        log::warn!("Connection to {} failed", remote);
                        self.fail_link(&remote);
                        return NegotiationOutcome::StateChanged {
                            peer_id: remote,
                            state: PeerState::Failed,
                        };
                    }
                    TransportStatus::Closed => {
                        self.close_link(&remote);
                        return NegotiationOutcome::StateChanged {
                            peer_id: remote,
                            state: PeerState::Closed,
                        };
                    }
                };

                match self.links.get_mut(&remote) {
                    Some(link) if link.state != state => {
                        link.state = state;
                        NegotiationOutcome::StateChanged { peer_id: remote, state }
                    }
                    _ => NegotiationOutcome::Ignored,
                }
            }
        }
    }

    fn close_link(&mut self, remote: &str) -> bool {
        match self.links.remove(remote) {
            Some(mut link) => {
                link.conn.close();
                self.finished.insert(remote.to_string(), PeerState::Closed);
                true
            }
            None => false,
        }
    }

    /// Tear down the link to a departed peer.
    pub fn on_peer_left(&mut self, remote: &str) -> bool {
        let closed = self.close_link(remote);
        if closed {
            log::debug!("Closed connection to {}", remote);
        }
        closed
    }

    /// Offer on every link, or defer until the link is stable.
    fn renegotiate_all(&mut self) -> Vec<OutgoingSignal> {
        let mut out = Vec::new();
        let mut failed = Vec::new();
        for (remote, link) in self.links.iter_mut() {
            if link.signaling != SignalingState::Stable {
                link.negotiation_needed = true;
                continue;
            }
            match link.offer(remote) {
                Ok(offer) => out.push(offer),
                Err(e) => {
                    log::warn!("Renegotiation with {} failed: {}", remote, e);
                    failed.push(remote.clone());
                }
            }
        }
        for remote in failed {
            self.fail_link(&remote);
        }
        out
    }

    /// Replace the webcam/microphone tracks on every link.
    pub fn set_webcam_tracks(&mut self, tracks: Vec<LocalTrack>) -> Vec<OutgoingSignal> {
        self.webcam = tracks;
        let mut failed = Vec::new();
        for (remote, link) in self.links.iter_mut() {
            let swap = (|| -> Result<(), MediaError> {
                for sender in link.webcam_senders.drain(..) {
                    link.conn.remove_track(sender)?;
                }
                for track in &self.webcam {
                    let sender = link.conn.add_track(track)?;
                    link.webcam_senders.push(sender);
                }
                Ok(())
            })();
            if let Err(e) = swap {
                log::warn!("Swapping webcam tracks for {} failed: {}", remote, e);
                failed.push(remote.clone());
            }
        }
        for remote in failed {
            self.fail_link(&remote);
        }
        self.renegotiate_all()
    }

    /// Attach a new screen-share to every existing link and renegotiate.
    pub fn add_local_share(&mut self, share_id: &str, tracks: Vec<LocalTrack>) -> Vec<OutgoingSignal> {
        let mut failed = Vec::new();
        for (remote, link) in self.links.iter_mut() {
            let attach = (|| -> Result<(), MediaError> {
                for track in &tracks {
                    let sender = link.conn.add_track(track)?;
                    link.share_senders.entry(share_id.to_string()).or_default().push(sender);
                }
                Ok(())
            })();
            if let Err(e) = attach {
                log::warn!("Attaching share {} for {} failed: {}", share_id, remote, e);
                failed.push(remote.clone());
            }
        }
        for remote in failed {
            self.fail_link(&remote);
        }
        self.shares.insert(share_id.to_string(), tracks);
        self.renegotiate_all()
    }

    pub fn remove_local_share(&mut self, share_id: &str) -> Vec<OutgoingSignal> {
        if self.shares.remove(share_id).is_none() {
            return Vec::new();
        }
        for (remote, link) in self.links.iter_mut() {
            for sender in link.share_senders.remove(share_id).unwrap_or_default() {
                if let Err(e) = link.conn.remove_track(sender) {
                    log::debug!("Removing share track for {} failed: {}", remote, e);
                }
            }
        }
        self.renegotiate_all()
    }

    pub fn local_shares(&self) -> Vec<String> {
        self.shares.keys().cloned().collect()
    }

    /// Close every link, keeping local tracks.
    pub fn close_all(&mut self) {
        let remotes: Vec<PeerId> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.close_link(&remote);
        }
    }

    /// Adopt a new local id after a signaling reconnect. Every existing
    /// link references the old id and is closed.
    pub fn set_local_id(&mut self, local_id: impl Into<PeerId>) {
        self.close_all();
        self.finished.clear();
        self.local_id = local_id.into();
    }

    /// Full teardown on leave: links closed, captures stopped.
    pub fn shutdown(&mut self) {
        self.close_all();
        self.shares.clear();
        self.webcam.clear();
        self.engine.stop_local_tracks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Debug)]
    struct ConnLog {
        local: Option<(SdpKind, String)>,
        remote: Option<(SdpKind, String)>,
        candidates: Vec<String>,
        tracks: Vec<String>,
        rollbacks: u32,
        closed: bool,
    }

    struct FakeConnection {
        owner: String,
        remote: String,
        offers: u32,
        next_sender: u64,
        senders: HashMap<u64, String>,
        log: Arc<Mutex<ConnLog>>,
    }

    impl PeerConnection for FakeConnection {
        fn create_offer(&mut self) -> Result<String, MediaError> {
            self.offers += 1;
            Ok(format!("offer:{}->{}#{}", self.owner, self.remote, self.offers))
        }

        fn create_answer(&mut self) -> Result<String, MediaError> {
            Ok(format!("answer:{}->{}", self.owner, self.remote))
        }

        fn set_local_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
            self.log.lock().unwrap().local = Some((kind, sdp.to_string()));
            Ok(())
        }

        fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
            if sdp.is_empty() {
                return Err(MediaError("empty sdp".into()));
            }
            self.log.lock().unwrap().remote = Some((kind, sdp.to_string()));
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), MediaError> {
            let mut log = self.log.lock().unwrap();
            log.rollbacks += 1;
            log.local = None;
            Ok(())
        }

        fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
            self.log.lock().unwrap().candidates.push(candidate.candidate.clone());
            Ok(())
        }

        fn add_track(&mut self, track: &LocalTrack) -> Result<SenderId, MediaError> {
            self.next_sender += 1;
            self.senders.insert(self.next_sender, track.id.clone());
            self.log.lock().unwrap().tracks.push(track.id.clone());
            Ok(SenderId(self.next_sender))
        }

        fn remove_track(&mut self, sender: SenderId) -> Result<(), MediaError> {
            let id = self
                .senders
                .remove(&sender.0)
                .ok_or_else(|| MediaError("unknown sender".into()))?;
            self.log.lock().unwrap().tracks.retain(|t| *t != id);
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed = true;
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        owner: String,
        conns: HashMap<String, Arc<Mutex<ConnLog>>>,
        stopped: bool,
        refuse: bool,
    }

    impl FakeEngine {
        fn new(owner: &str) -> Self {
            Self {
                owner: owner.into(),
                ..Self::default()
            }
        }

        fn log(&self, remote: &str) -> std::sync::MutexGuard<'_, ConnLog> {
            self.conns[remote].lock().unwrap()
        }
    }

    impl MediaEngine for FakeEngine {
        type Connection = FakeConnection;

        fn create_connection(&mut self, remote: &str) -> Result<FakeConnection, MediaError> {
            if self.refuse {
                return Err(MediaError("no media".into()));
            }
            let log = Arc::new(Mutex::new(ConnLog::default()));
            self.conns.insert(remote.to_string(), log.clone());
            Ok(FakeConnection {
                owner: self.owner.clone(),
                remote: remote.to_string(),
                offers: 0,
                next_sender: 0,
                senders: HashMap::new(),
                log,
            })
        }

        fn stop_local_tracks(&mut self) {
            self.stopped = true;
        }
    }

    fn orchestrator(id: &str) -> PeerOrchestrator<FakeEngine> {
        PeerOrchestrator::new(id, FakeEngine::new(id))
    }

    fn track(id: &str, stream: &str) -> LocalTrack {
        LocalTrack {
            id: id.into(),
            kind: TrackKind::Video,
            stream_id: stream.into(),
        }
    }

    fn candidate(c: &str) -> IceCandidate {
        IceCandidate {
            candidate: c.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Deliver signals between two orchestrators until quiet.
    fn pump(a: &mut PeerOrchestrator<FakeEngine>, b: &mut PeerOrchestrator<FakeEngine>, mut queue: Vec<OutgoingSignal>) {
        let a_id = a.local_id().to_string();
        let b_id = b.local_id().to_string();
        while !queue.is_empty() {
            let mut next = Vec::new();
            for sig in queue {
                if sig.to == b_id {
                    next.extend(b.on_signal(&a_id, sig.signal).unwrap());
                } else {
                    next.extend(a.on_signal(&b_id, sig.signal).unwrap());
                }
            }
            queue = next;
        }
    }

    fn connect(o: &mut PeerOrchestrator<FakeEngine>, remote: &str) {
        o.handle_media_event(MediaEvent {
            remote: remote.into(),
            kind: MediaEventKind::StateChanged(TransportStatus::Connected),
        });
    }

    #[test]
    fn test_signal_payload_wire_shape() {
        let json = serde_json::to_value(SignalPayload::Candidate {
            candidate: candidate("c1"),
        })
        .unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(json["candidate"]["sdpMid"], "0");

        let offer: SignalPayload = serde_json::from_str(r#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(offer, SignalPayload::Offer { sdp: "v=0".into() });
    }

    #[test]
    fn test_join_offer_answer_connects() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        a.set_webcam_tracks(vec![track("cam-a", "sa")]);

        let offers = a.on_peer_joined("p2").unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(a.state("p2"), PeerState::Connecting);
        assert_eq!(a.signaling_state("p2"), Some(SignalingState::HaveLocalOffer));
        assert_eq!(a.engine().log("p2").tracks, vec!["cam-a".to_string()]);

        pump(&mut a, &mut b, offers);
        assert_eq!(a.signaling_state("p2"), Some(SignalingState::Stable));
        assert_eq!(b.signaling_state("p1"), Some(SignalingState::Stable));

        connect(&mut a, "p2");
        connect(&mut b, "p1");
        assert_eq!(a.state("p2"), PeerState::Connected);
        assert_eq!(b.state("p1"), PeerState::Connected);
    }

    #[test]
    fn test_glare_polite_peer_yields() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");

        let offer_a = a.on_peer_joined("p2").unwrap();
        let offer_b = b.on_peer_joined("p1").unwrap();

        // Both offers cross in flight.
        let from_b = b.on_signal("p1", offer_a[0].signal.clone()).unwrap();
        let from_a = a.on_signal("p2", offer_b[0].signal.clone()).unwrap();

        // p2 is impolite and ignores p1's offer.
        assert!(from_b.is_empty());
        assert_eq!(b.signaling_state("p1"), Some(SignalingState::HaveLocalOffer));
        // p1 is polite: rolls back, answers p2, then re-offers its own side.
        assert_eq!(a.engine().log("p2").rollbacks, 1);
        assert!(matches!(
            &from_a[..],
            [
                OutgoingSignal { signal: SignalPayload::Answer { .. }, .. },
                OutgoingSignal { signal: SignalPayload::Offer { .. }, .. },
            ]
        ));
        // The offer that won the glare is p2's.
        let a_remote = a.engine().log("p2").remote.clone().unwrap();
        assert_eq!(a_remote, (SdpKind::Offer, "offer:p2->p1#1".to_string()));

        pump(&mut a, &mut b, from_a);
        assert_eq!(a.signaling_state("p2"), Some(SignalingState::Stable));
        assert_eq!(b.signaling_state("p1"), Some(SignalingState::Stable));
        assert_eq!(b.engine().log("p1").rollbacks, 0);
        let b_remote = b.engine().log("p1").remote.clone().unwrap();
        assert_eq!(b_remote, (SdpKind::Offer, "offer:p1->p2#2".to_string()));

        connect(&mut a, "p2");
        connect(&mut b, "p1");
        assert_eq!(a.peers(), vec!["p2".to_string()]);
        assert_eq!(b.peers(), vec!["p1".to_string()]);
        assert_eq!(a.state("p2"), PeerState::Connected);
    }

    #[test]
    fn test_glare_is_symmetric_in_delivery_order() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        let offer_a = a.on_peer_joined("p2").unwrap();
        let offer_b = b.on_peer_joined("p1").unwrap();

        // Deliver in the opposite order.
        let from_a = a.on_signal("p2", offer_b[0].signal.clone()).unwrap();
        let from_b = b.on_signal("p1", offer_a[0].signal.clone()).unwrap();
        assert!(from_b.is_empty());
        pump(&mut a, &mut b, from_a);

        assert_eq!(a.engine().log("p2").rollbacks, 1);
        assert_eq!(b.engine().log("p1").rollbacks, 0);
        assert_eq!(a.signaling_state("p2"), Some(SignalingState::Stable));
        assert_eq!(b.signaling_state("p1"), Some(SignalingState::Stable));
    }

    #[test]
    fn test_glare_on_simultaneous_shares_offers_both_sides() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        let o = a.on_peer_joined("p2").unwrap();
        pump(&mut a, &mut b, o);

        let offer_a = a.add_local_share("s1", vec![track("screen-a", "ss1")]);
        let offer_b = b.add_local_share("s2", vec![track("screen-b", "ss2")]);
        assert_eq!((offer_a.len(), offer_b.len()), (1, 1));

        // The offers cross; impolite p2 ignores p1's.
        assert!(b.on_signal("p1", offer_a[0].signal.clone()).unwrap().is_empty());
        let from_a = a.on_signal("p2", offer_b[0].signal.clone()).unwrap();
        assert!(from_a
            .iter()
            .any(|o| matches!(&o.signal, SignalPayload::Offer { .. })));
        pump(&mut a, &mut b, from_a);

        assert_eq!(a.signaling_state("p2"), Some(SignalingState::Stable));
        assert_eq!(b.signaling_state("p1"), Some(SignalingState::Stable));
        // p1's share still reached p2 through the follow-up offer.
        let (kind, sdp) = b.engine().log("p1").remote.clone().unwrap();
        assert_eq!(kind, SdpKind::Offer);
        assert!(sdp.starts_with("offer:p1->p2"), "{sdp}");
        assert!(a.engine().log("p2").tracks.contains(&"screen-a".to_string()));
    }

    #[test]
    fn test_stale_answer_dropped() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        let offers = a.on_peer_joined("p2").unwrap();
        let answers = b.on_signal("p1", offers[0].signal.clone()).unwrap();

        a.on_signal("p2", answers[0].signal.clone()).unwrap();
        let before = a.engine().log("p2").remote.clone();

        // Duplicate answer while stable is ignored.
        let out = a
            .on_signal("p2", SignalPayload::Answer { sdp: "answer:late".into() })
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(a.engine().log("p2").remote, before);
        assert_eq!(a.state("p2"), PeerState::Connecting);
    }

    #[test]
    fn test_candidates_queued_until_remote_description() {
        let mut a = orchestrator("p1");
        let offers = a.on_peer_joined("p2").unwrap();
        assert_eq!(offers.len(), 1);

        a.on_signal("p2", SignalPayload::Candidate { candidate: candidate("early") })
            .unwrap();
        assert!(a.engine().log("p2").candidates.is_empty());

        a.on_signal("p2", SignalPayload::Answer { sdp: "answer:p2->p1".into() })
            .unwrap();
        assert_eq!(a.engine().log("p2").candidates, vec!["early".to_string()]);

        a.on_signal("p2", SignalPayload::Candidate { candidate: candidate("late") })
            .unwrap();
        assert_eq!(a.engine().log("p2").candidates.len(), 2);
    }

    #[test]
    fn test_screen_share_renegotiates_existing_links() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        let mut c = orchestrator("p3");

        let o = a.on_peer_joined("p2").unwrap();
        pump(&mut a, &mut b, o);
        let o = a.on_peer_joined("p3").unwrap();
        pump(&mut a, &mut c, o);

        let offers = a.add_local_share("s1", vec![track("screen-a", "ss1")]);
        let mut targets: Vec<String> = offers.iter().map(|o| o.to.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec!["p2".to_string(), "p3".to_string()]);
        assert!(offers
            .iter()
            .all(|o| matches!(&o.signal, SignalPayload::Offer { sdp } if sdp.ends_with("#2"))));
        assert!(a.engine().log("p2").tracks.contains(&"screen-a".to_string()));

        // Same links, not new connections.
        assert_eq!(b.peers(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_track_change_mid_negotiation_deferred() {
        let mut a = orchestrator("p1");
        let mut b = orchestrator("p2");
        let offers = a.on_peer_joined("p2").unwrap();

        // Offer still in flight: no second offer yet.
        assert!(a.add_local_share("s1", vec![track("screen-a", "ss1")]).is_empty());

        let answers = b.on_signal("p1", offers[0].signal.clone()).unwrap();
        let follow_up = a.on_signal("p2", answers[0].signal.clone()).unwrap();
        assert!(matches!(&follow_up[..], [OutgoingSignal { signal: SignalPayload::Offer { .. }, .. }]));
        pump(&mut a, &mut b, follow_up);
        assert_eq!(a.signaling_state("p2"), Some(SignalingState::Stable));
    }

    #[test]
    fn test_late_joiner_gets_active_shares() {
        let mut a = orchestrator("p1");
        a.add_local_share("s1", vec![track("screen-a", "ss1")]);
        a.on_peer_joined("p2").unwrap();
        assert_eq!(a.engine().log("p2").tracks, vec!["screen-a".to_string()]);

        a.remove_local_share("s1");
        assert!(a.engine().log("p2").tracks.is_empty());
        assert!(a.local_shares().is_empty());
    }

    #[test]
    fn test_failure_tears_down() {
        let mut a = orchestrator("p1");
        a.on_peer_joined("p2").unwrap();

        let outcome = a.handle_media_event(MediaEvent {
            remote: "p2".into(),
            kind: MediaEventKind::StateChanged(TransportStatus::Failed),
        });
        assert_eq!(
            outcome,
            NegotiationOutcome::StateChanged { peer_id: "p2".into(), state: PeerState::Failed }
        );
        assert!(a.engine().log("p2").closed);
        assert_eq!(a.state("p2"), PeerState::Failed);
        assert!(a.peers().is_empty());

        // A fresh join replaces the terminal state.
        a.on_peer_joined("p2").unwrap();
        assert_eq!(a.state("p2"), PeerState::Connecting);
    }

    #[test]
    fn test_peer_left_closes() {
        let mut a = orchestrator("p1");
        a.on_peer_joined("p2").unwrap();
        assert!(a.on_peer_left("p2"));
        assert!(!a.on_peer_left("p2"));
        assert_eq!(a.state("p2"), PeerState::Closed);
        assert_eq!(a.state("p9"), PeerState::None);
    }

    #[test]
    fn test_engine_refusal_surfaces_error() {
        let mut a = orchestrator("p1");
        a.engine_mut().refuse = true;
        match a.on_peer_joined("p2") {
            Err(NegotiationError::Media { peer, .. }) => assert_eq!(peer, "p2"),
            other => panic!("Expected media error, got {other:?}"),
        }
        assert_eq!(a.state("p2"), PeerState::Failed);
    }

    #[test]
    fn test_local_candidate_and_track_events() {
        let mut a = orchestrator("p1");
        a.on_peer_joined("p2").unwrap();

        let sig = a.handle_media_event(MediaEvent {
            remote: "p2".into(),
            kind: MediaEventKind::LocalCandidate(candidate("mine")),
        });
        assert!(matches!(sig, NegotiationOutcome::Signal(OutgoingSignal { ref to, .. }) if to == "p2"));

        let remote_track = RemoteTrack {
            track_id: "t".into(),
            stream_id: "s".into(),
            kind: TrackKind::Video,
        };
        let t = a.handle_media_event(MediaEvent {
            remote: "p2".into(),
            kind: MediaEventKind::Track(remote_track.clone()),
        });
        assert_eq!(t, NegotiationOutcome::Track { peer_id: "p2".into(), track: remote_track });

        let ignored = a.handle_media_event(MediaEvent {
            remote: "ghost".into(),
            kind: MediaEventKind::LocalCandidate(candidate("x")),
        });
        assert_eq!(ignored, NegotiationOutcome::Ignored);
    }

    #[test]
    fn test_new_local_id_closes_everything() {
        let mut a = orchestrator("p1");
        a.on_peer_joined("p2").unwrap();
        a.on_peer_joined("p3").unwrap();

        a.set_local_id("p9");
        assert_eq!(a.local_id(), "p9");
        assert!(a.peers().is_empty());
        assert!(a.engine().log("p2").closed);
        assert!(a.engine().log("p3").closed);
    }

    #[test]
    fn test_shutdown_stops_media() {
        let mut a = orchestrator("p1");
        a.set_webcam_tracks(vec![track("cam", "s")]);
        a.on_peer_joined("p2").unwrap();
        a.shutdown();
        assert!(a.engine().stopped);
        assert!(a.peers().is_empty());
    }
}
