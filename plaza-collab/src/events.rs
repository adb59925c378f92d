//! Named signaling events exchanged as JSON text frames.
//!
//! Every frame is `{"event": "<kebab-name>", "data": {...}}` with camelCase
//! field names inside `data`.

use serde::{Deserialize, Serialize};

use plaza_core::{PeerId, SignalPayload};

/// World coordinates of an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A member of a space as listed in `space-state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub username: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Joined,
    Left,
}

/// Display-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub username: String,
    /// Unix milliseconds.
    pub at: u64,
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinSpace { space_id: String, username: String },
    Signal { to: PeerId, signal: SignalPayload },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted { share_id: String },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped { share_id: String },
    #[serde(rename_all = "camelCase")]
    GetSpaceInfo { space_id: String },
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { peer_id: PeerId },
    SpaceState { peers: Vec<PeerSummary> },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: PeerId,
        username: String,
        position: Position,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    /// `from` is stamped by the relay; clients cannot spoof it.
    Signal {
        to: PeerId,
        from: PeerId,
        signal: SignalPayload,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStarted { peer_id: PeerId, share_id: String },
    #[serde(rename_all = "camelCase")]
    ScreenShareStopped { peer_id: PeerId, share_id: String },
    #[serde(rename_all = "camelCase")]
    SpaceInfo {
        space_id: String,
        exists: bool,
        participants: Vec<String>,
    },
    SpaceActivity { events: Vec<ActivityEvent> },
    Error { message: String },
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SpaceState { .. } => "space-state",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Signal { .. } => "signal",
            Self::ScreenShareStarted { .. } => "screen-share-started",
            Self::ScreenShareStopped { .. } => "screen-share-stopped",
            Self::SpaceInfo { .. } => "space-info",
            Self::SpaceActivity { .. } => "space-activity",
            Self::Error { .. } => "error",
        }
    }
}
