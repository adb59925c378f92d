//! Inbound track attribution.
//!
//! A remote peer sends one webcam stream plus zero or more screen-share
//! streams over the same connection. The media layer only tells us the
//! stream id, so attribution relies on two pieces of per-peer memory:
//!
//! - a FIFO of share ids announced via `screen-share-started` whose track
//!   has not arrived yet
//! - the stream id already identified as the webcam
//!
//! Streams already bound to an identity keep it across renegotiations.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::PeerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A track surfaced by the media engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackTarget {
    Webcam,
    ScreenShare(String),
}

/// Which rule produced an assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignmentOrigin {
    /// Audio always belongs to the peer's voice/webcam identity.
    Audio,
    /// Stream previously bound to a screen-share.
    KnownShare,
    /// Stream previously identified as the webcam (renegotiation).
    KnownWebcam,
    /// Dequeued from the pending announcement FIFO.
    Announced,
    /// First unannounced stream from this peer.
    FirstStream,
    /// Unannounced extra stream; id synthesized from peer + stream.
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackAssignment {
    pub peer_id: PeerId,
    pub stream_id: String,
    pub target: TrackTarget,
    pub origin: AssignmentOrigin,
}

impl TrackAssignment {
    /// True when the UI should reattach rather than create a new element.
    pub fn is_reattach(&self) -> bool {
        matches!(
            self.origin,
            AssignmentOrigin::KnownShare | AssignmentOrigin::KnownWebcam
        )
    }
}

/// Deterministic screen-share id for an unannounced stream.
pub fn fallback_share_id(peer_id: &str, stream_id: &str) -> String {
    format!("{peer_id}-{stream_id}")
}

#[derive(Default)]
struct PeerTracks {
    pending: VecDeque<String>,
    webcam_stream: Option<String>,
    /// stream id → share id
    share_streams: HashMap<String, String>,
}

impl PeerTracks {
    fn is_bound(&self, share_id: &str) -> bool {
        self.share_streams.values().any(|s| s == share_id)
    }
}

#[derive(Default)]
pub struct TrackClassifier {
    peers: HashMap<PeerId, PeerTracks>,
}

impl TrackClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `screen-share-started` announcement. Replays of an id that
    /// is already queued or already bound to a stream are ignored.
    pub fn announce(&mut self, peer_id: &str, share_id: &str) {
        let tracks = self.peers.entry(peer_id.to_string()).or_default();
        if tracks.pending.iter().any(|s| s == share_id) || tracks.is_bound(share_id) {
            log::trace!("Ignoring repeated announcement {} from {}", share_id, peer_id);
            return;
        }
        tracks.pending.push_back(share_id.to_string());
    }

    /// Forget a share on `screen-share-stopped`.
    pub fn withdraw(&mut self, peer_id: &str, share_id: &str) {
        if let Some(tracks) = self.peers.get_mut(peer_id) {
            tracks.pending.retain(|s| s != share_id);
            tracks.share_streams.retain(|_, s| s != share_id);
        }
    }

    pub fn pending(&self, peer_id: &str) -> Vec<String> {
        self.peers
            .get(peer_id)
            .map(|t| t.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn webcam_stream(&self, peer_id: &str) -> Option<&str> {
        self.peers.get(peer_id)?.webcam_stream.as_deref()
    }

    /// Drop all memory for a peer (peer-left or connection teardown).
    pub fn forget_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn reset(&mut self) {
        self.peers.clear();
    }

    pub fn classify(&mut self, peer_id: &str, track: &RemoteTrack) -> TrackAssignment {
        let tracks = self.peers.entry(peer_id.to_string()).or_default();
        let stream = track.stream_id.clone();

        let (target, origin) = if track.kind == TrackKind::Audio {
            if tracks.webcam_stream.is_none() && !tracks.share_streams.contains_key(&stream) {
                tracks.webcam_stream = Some(stream.clone());
            }
            (TrackTarget::Webcam, AssignmentOrigin::Audio)
        } else if let Some(share_id) = tracks.share_streams.get(&stream) {
            (TrackTarget::ScreenShare(share_id.clone()), AssignmentOrigin::KnownShare)
        } else if tracks.webcam_stream.as_deref() == Some(stream.as_str()) {
            (TrackTarget::Webcam, AssignmentOrigin::KnownWebcam)
        } else if let Some(share_id) = tracks.pending.pop_front() {
            tracks.share_streams.insert(stream.clone(), share_id.clone());
            (TrackTarget::ScreenShare(share_id), AssignmentOrigin::Announced)
        } else if tracks.webcam_stream.is_none() {
            tracks.webcam_stream = Some(stream.clone());
            (TrackTarget::Webcam, AssignmentOrigin::FirstStream)
        } else {
            let share_id = fallback_share_id(peer_id, &stream);
            log::warn!(
                "Unannounced stream {} from {}; treating as screen-share {}",
                stream,
                peer_id,
                share_id
            );
            tracks.share_streams.insert(stream.clone(), share_id.clone());
            (TrackTarget::ScreenShare(share_id), AssignmentOrigin::Fallback)
        };

        TrackAssignment {
            peer_id: peer_id.to_string(),
            stream_id: stream,
            target,
            origin,
        }
    }
}
