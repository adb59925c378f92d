//! # plaza-core — shared-space state for Plaza
//!
//! Everything in this crate is synchronous and I/O free. The network layer
//! (`plaza-collab`) feeds it bytes and events and ships out whatever it
//! returns.
//!
//! ```text
//!  UI mutation ──▸ DocumentBridge ──▸ SpaceDocument (yrs) ──▸ delta bytes
//!                        ▲                                       │
//!                        └──── apply_remote ◂── relay ◂──────────┘
//!
//!  peer-joined / signal ──▸ PeerOrchestrator ──▸ OutgoingSignal
//!  inbound track        ──▸ TrackClassifier  ──▸ TrackAssignment
//! ```
//!
//! ## Modules
//!
//! - [`document`] — replicated maps + note text bodies over a yrs `Doc`
//! - [`bridge`] — projection of the document into snapshots and observers
//! - [`negotiation`] — per-remote-peer offer/answer state machine
//! - [`classifier`] — webcam vs. screen-share attribution of inbound tracks

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod bridge;
pub mod classifier;
pub mod document;
pub mod negotiation;

pub use bridge::{BridgeError, Change, ChangeSet, DocumentBridge, NoteStyle, Snapshot};
pub use classifier::{AssignmentOrigin, RemoteTrack, TrackAssignment, TrackClassifier, TrackKind, TrackTarget};
pub use document::{DocumentError, SpaceDocument};
pub use negotiation::{
    IceCandidate, LocalTrack, MediaEngine, MediaError, MediaEvent, MediaEventKind,
    NegotiationError, NegotiationOutcome, OutgoingSignal, PeerConnection, PeerOrchestrator,
    PeerState, SdpKind, SenderId, SignalPayload, SignalingState, TransportStatus,
};

/// Ephemeral identifier the relay hands out on every connect.
pub type PeerId = String;

/// Encoded CRDT update ready to ship to the relay.
pub type Delta = Vec<u8>;

/// Minimum screen-share size enforced by the mutators.
pub const MIN_SHARE_WIDTH: f64 = 320.0;
pub const MIN_SHARE_HEIGHT: f64 = 200.0;

/// Minimum text-note size enforced by the mutators.
pub const MIN_NOTE_WIDTH: f64 = 120.0;
pub const MIN_NOTE_HEIGHT: f64 = 80.0;

/// Scalar stored in a single replicated field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Decoded fields of one entity, keyed by wire name.
pub type FieldMap = HashMap<String, FieldValue>;

/// The three replicated entity maps of a space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Peers,
    ScreenShares,
    TextNotes,
}

impl Collection {
    /// Root map name inside the shared document.
    pub fn map_name(self) -> &'static str {
        match self {
            Collection::Peers => "peers",
            Collection::ScreenShares => "screenShares",
            Collection::TextNotes => "textNotes",
        }
    }
}

/// A typed entity stored as a nested map of fields.
pub trait Entity: Clone + PartialEq + Sized {
    const COLLECTION: Collection;

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)>;

    fn from_fields(fields: &FieldMap) -> Result<Self, DocumentError>;
}

fn number(fields: &FieldMap, key: &'static str) -> Result<f64, DocumentError> {
    match fields.get(key) {
        Some(FieldValue::Number(n)) => Ok(*n),
        _ => Err(DocumentError::MissingField(key)),
    }
}

fn boolean(fields: &FieldMap, key: &'static str) -> Result<bool, DocumentError> {
    match fields.get(key) {
        Some(FieldValue::Bool(b)) => Ok(*b),
        _ => Err(DocumentError::MissingField(key)),
    }
}

fn text(fields: &FieldMap, key: &'static str) -> Result<String, DocumentError> {
    match fields.get(key) {
        Some(FieldValue::Text(s)) => Ok(s.clone()),
        _ => Err(DocumentError::MissingField(key)),
    }
}

/// A participant's replicated presence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub username: String,
    pub x: f64,
    pub y: f64,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub status: String,
}

impl PeerEntry {
    pub fn new(username: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            username: username.into(),
            x,
            y,
            is_muted: false,
            is_video_off: false,
            status: String::new(),
        }
    }
}

impl Entity for PeerEntry {
    const COLLECTION: Collection = Collection::Peers;

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("username", self.username.clone().into()),
            ("x", self.x.into()),
            ("y", self.y.into()),
            ("isMuted", self.is_muted.into()),
            ("isVideoOff", self.is_video_off.into()),
            ("status", self.status.clone().into()),
        ]
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, DocumentError> {
        Ok(Self {
            username: text(fields, "username")?,
            x: number(fields, "x")?,
            y: number(fields, "y")?,
            // Older clients omit media flags until first toggle.
            is_muted: boolean(fields, "isMuted").unwrap_or(false),
            is_video_off: boolean(fields, "isVideoOff").unwrap_or(false),
            status: text(fields, "status").unwrap_or_default(),
        })
    }
}

/// A movable screen-share window owned by one peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareEntry {
    pub peer_id: PeerId,
    pub username: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Entity for ScreenShareEntry {
    const COLLECTION: Collection = Collection::ScreenShares;

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("peerId", self.peer_id.clone().into()),
            ("username", self.username.clone().into()),
            ("x", self.x.into()),
            ("y", self.y.into()),
            ("width", self.width.into()),
            ("height", self.height.into()),
        ]
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, DocumentError> {
        Ok(Self {
            peer_id: text(fields, "peerId")?,
            username: text(fields, "username")?,
            x: number(fields, "x")?,
            y: number(fields, "y")?,
            width: number(fields, "width")?,
            height: number(fields, "height")?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl FontSize {
    pub fn as_str(self) -> &'static str {
        match self {
            FontSize::Small => "small",
            FontSize::Medium => "medium",
            FontSize::Large => "large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "small" => Some(FontSize::Small),
            "medium" => Some(FontSize::Medium),
            "large" => Some(FontSize::Large),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontFamily {
    #[default]
    Sans,
    Serif,
    Mono,
}

impl FontFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            FontFamily::Sans => "sans",
            FontFamily::Serif => "serif",
            FontFamily::Mono => "mono",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sans" => Some(FontFamily::Sans),
            "serif" => Some(FontFamily::Serif),
            "mono" => Some(FontFamily::Mono),
            _ => None,
        }
    }
}

/// Geometry and style of a shared text note. The body lives in its own
/// replicated text, see [`SpaceDocument::note_text`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNoteEntry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub font_size: FontSize,
    pub font_family: FontFamily,
    pub color: String,
}

impl TextNoteEntry {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            width: 240.0,
            height: 160.0,
            font_size: FontSize::default(),
            font_family: FontFamily::default(),
            color: "#ffffff".to_string(),
        }
    }
}

impl Entity for TextNoteEntry {
    const COLLECTION: Collection = Collection::TextNotes;

    fn to_fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("x", self.x.into()),
            ("y", self.y.into()),
            ("width", self.width.into()),
            ("height", self.height.into()),
            ("fontSize", self.font_size.as_str().into()),
            ("fontFamily", self.font_family.as_str().into()),
            ("color", self.color.clone().into()),
        ]
    }

    fn from_fields(fields: &FieldMap) -> Result<Self, DocumentError> {
        let font_size = text(fields, "fontSize")?;
        let font_family = text(fields, "fontFamily")?;
        Ok(Self {
            x: number(fields, "x")?,
            y: number(fields, "y")?,
            width: number(fields, "width")?,
            height: number(fields, "height")?,
            font_size: FontSize::parse(&font_size)
                .ok_or(DocumentError::InvalidField("fontSize", font_size))?,
            font_family: FontFamily::parse(&font_family)
                .ok_or(DocumentError::InvalidField("fontFamily", font_family))?,
            color: text(fields, "color")?,
        })
    }
}

/// Generate a collision-free id for a new share or note.
pub fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
