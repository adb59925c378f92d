//! # plaza-collab — networking for shared spaces
//!
//! The relay server and everything a client needs to talk to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   /signal  (JSON events)    ┌──────────────┐
//! │ SpaceSession │ ◄─────────────────────────► │ RelayServer  │
//! │  transport   │                             │ PeerRegistry │
//! │  provider    │ ◄─────────────────────────► │ doc rooms    │
//! └──────┬───────┘   /doc/{space} (binary)     └──────┬───────┘
//!        │                                            │
//!        ▼                                            ▼
//! ┌──────────────┐                             ┌──────────────┐
//! │DocumentBridge│                             │BroadcastGroup│
//! │ Orchestrator │                             │  (fan-out)   │
//! │  Classifier  │                             └──────────────┘
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`events`] — Named signaling events (JSON)
//! - [`protocol`] — Document sync wire protocol (bincode-encoded `SyncMessage`)
//! - [`channel`] — Reconnecting WebSocket channel with backoff
//! - [`transport`] — Signaling transport client
//! - [`provider`] — Document sync client with offline queue
//! - [`session`] — Per-space client context
//! - [`registry`] — Server-side peer/space registry
//! - [`broadcast`] — Per-room fan-out with backpressure
//! - [`server`] — Relay server

pub mod broadcast;
pub mod channel;
pub mod events;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Frame};
pub use channel::{Channel, ChannelEvent, ConnectionState, ReconnectPolicy, TransportError};
pub use events::{ActivityEvent, ActivityKind, ClientEvent, PeerSummary, Position, ServerEvent};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use provider::{DocumentProvider, OfflineQueue, ProviderEvent};
pub use registry::{Departure, PeerRegistry, SpawnRegion};
pub use server::{RelayError, RelayServer, ServerConfig, ServerStats};
pub use session::{SessionConfig, SessionError, SessionEvent, SpaceSession};
pub use transport::{SignalingTransport, TransportEvent};
