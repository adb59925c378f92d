//! Server-side membership table.
//!
//! ```text
//! spaces:       space_id → { peers: peer_id → PeerSummary, activity ring }
//! peer_sockets: peer_id  → { connection id, outbox, current space }
//! ```
//!
//! Every accepted signaling socket gets a fresh peer id; ids are never
//! reused across reconnects. Spaces exist only while someone is in them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

use plaza_core::{PeerId, SignalPayload};

use crate::broadcast::ConnectionId;
use crate::events::{ActivityEvent, ActivityKind, PeerSummary, Position, ServerEvent};

/// Square region new avatars are dropped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnRegion {
    pub min: f64,
    pub max: f64,
}

impl Default for SpawnRegion {
    fn default() -> Self {
        Self {
            min: 1800.0,
            max: 2200.0,
        }
    }
}

impl SpawnRegion {
    fn sample(&self) -> Position {
        let mut rng = rand::thread_rng();
        if self.max <= self.min {
            return Position { x: self.min, y: self.min };
        }
        Position {
            x: rng.gen_range(self.min..=self.max),
            y: rng.gen_range(self.min..=self.max),
        }
    }
}

/// Where a disconnected peer was.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub peer_id: PeerId,
    pub space_id: String,
    pub username: String,
    /// True if the space was deleted because it became empty.
    pub space_closed: bool,
}

struct PeerSocket {
    conn: ConnectionId,
    outbox: UnboundedSender<ServerEvent>,
    space: Option<String>,
}

#[derive(Default)]
struct Space {
    peers: BTreeMap<PeerId, PeerSummary>,
    activity: VecDeque<ActivityEvent>,
}

impl Space {
    fn record(&mut self, kind: ActivityKind, username: &str, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.activity.len() >= limit {
            self.activity.pop_front();
        }
        self.activity.push_back(ActivityEvent {
            kind,
            username: username.to_string(),
            at: now_millis(),
        });
    }
}

#[derive(Default)]
struct Tables {
    spaces: HashMap<String, Space>,
    peer_sockets: HashMap<PeerId, PeerSocket>,
}

impl Tables {
    fn send(&self, peer_id: &str, event: ServerEvent) -> bool {
        match self.peer_sockets.get(peer_id) {
            Some(socket) => socket.outbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Send to everyone in `space_id` except `skip`.
    fn broadcast(&self, space_id: &str, skip: Option<&str>, event: &ServerEvent) -> usize {
        let Some(space) = self.spaces.get(space_id) else {
            return 0;
        };
        space
            .peers
            .keys()
            .filter(|id| Some(id.as_str()) != skip)
            .filter(|id| self.send(id, event.clone()))
            .count()
    }

    /// Remove `peer_id` from its current space, notifying the rest.
    fn leave_space(&mut self, peer_id: &str, history: usize) -> Option<Departure> {
        let space_id = self.peer_sockets.get_mut(peer_id)?.space.take()?;
        let space = self.spaces.get_mut(&space_id)?;
        let summary = space.peers.remove(peer_id)?;
        space.record(ActivityKind::Left, &summary.username, history);

        let space_closed = space.peers.is_empty();
        if space_closed {
            self.spaces.remove(&space_id);
            log::info!("Space {} removed (empty)", space_id);
        } else {
            self.broadcast(
                &space_id,
                None,
                &ServerEvent::PeerLeft {
                    peer_id: peer_id.to_string(),
                },
            );
        }
        log::info!("Peer {} ({}) left space {}", summary.username, peer_id, space_id);

        Some(Departure {
            peer_id: peer_id.to_string(),
            space_id,
            username: summary.username,
            space_closed,
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct PeerRegistry {
    tables: RwLock<Tables>,
    spawn: SpawnRegion,
    activity_history: usize,
}

impl PeerRegistry {
    pub fn new(spawn: SpawnRegion, activity_history: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            spawn,
            activity_history,
        }
    }

    /// Register a new socket, mint its peer id and greet it with `connected`.
    pub async fn connect(&self, conn: ConnectionId, outbox: UnboundedSender<ServerEvent>) -> PeerId {
        let peer_id = Uuid::new_v4().to_string();
        let _ = outbox.send(ServerEvent::Connected {
            peer_id: peer_id.clone(),
        });
        self.tables.write().await.peer_sockets.insert(
            peer_id.clone(),
            PeerSocket {
                conn,
                outbox,
                space: None,
            },
        );
        peer_id
    }

    /// Place the peer in a space: `space-state` to the joiner,
    /// `peer-joined` to everyone else.
    pub async fn join_space(&self, peer_id: &str, space_id: &str, username: &str) -> Option<PeerSummary> {
        let mut tables = self.tables.write().await;
        if !tables.peer_sockets.contains_key(peer_id) {
            return None;
        }
        // Switching spaces is a leave followed by a join.
        tables.leave_space(peer_id, self.activity_history);

        let summary = PeerSummary {
            peer_id: peer_id.to_string(),
            username: username.to_string(),
            position: self.spawn.sample(),
        };
        let space = tables.spaces.entry(space_id.to_string()).or_default();
        space.peers.insert(peer_id.to_string(), summary.clone());
        space.record(ActivityKind::Joined, username, self.activity_history);
        let peers: Vec<PeerSummary> = space.peers.values().cloned().collect();

        if let Some(socket) = tables.peer_sockets.get_mut(peer_id) {
            socket.space = Some(space_id.to_string());
        }
        tables.send(peer_id, ServerEvent::SpaceState { peers });
        tables.broadcast(
            space_id,
            Some(peer_id),
            &ServerEvent::PeerJoined {
                peer_id: summary.peer_id.clone(),
                username: summary.username.clone(),
                position: summary.position,
            },
        );
        log::info!("Peer {} ({}) joined space {}", username, peer_id, space_id);
        Some(summary)
    }

    /// Forward a signal to exactly one recipient. Unknown recipients are
    /// dropped, never retried.
    pub async fn relay_signal(&self, from: &str, to: &str, signal: SignalPayload) -> bool {
        let tables = self.tables.read().await;
        let delivered = tables.send(
            to,
            ServerEvent::Signal {
                to: to.to_string(),
                from: from.to_string(),
                signal,
            },
        );
        if !delivered {
            log::warn!("Dropping signal from {} to unknown peer {}", from, to);
        }
        delivered
    }

    /// Broadcast a share start/stop to the sender's space.
    pub async fn announce_share(&self, peer_id: &str, share_id: &str, started: bool) -> usize {
        let tables = self.tables.read().await;
        let Some(space_id) = tables.peer_sockets.get(peer_id).and_then(|s| s.space.clone()) else {
            log::debug!("Share announcement from {} outside any space", peer_id);
            return 0;
        };
        let event = if started {
            ServerEvent::ScreenShareStarted {
                peer_id: peer_id.to_string(),
                share_id: share_id.to_string(),
            }
        } else {
            ServerEvent::ScreenShareStopped {
                peer_id: peer_id.to_string(),
                share_id: share_id.to_string(),
            }
        };
        tables.broadcast(&space_id, Some(peer_id), &event)
    }

    /// Read-only preview of a space, sent only to the asker.
    pub async fn space_info(&self, requester: &str, space_id: &str) -> bool {
        let tables = self.tables.read().await;
        let participants: Vec<String> = tables
            .spaces
            .get(space_id)
            .map(|s| s.peers.values().map(|p| p.username.clone()).collect())
            .unwrap_or_default();
        tables.send(
            requester,
            ServerEvent::SpaceInfo {
                space_id: space_id.to_string(),
                exists: tables.spaces.contains_key(space_id),
                participants,
            },
        )
    }

    /// Forget a socket entirely.
    pub async fn disconnect(&self, peer_id: &str) -> Option<Departure> {
        let mut tables = self.tables.write().await;
        let departure = tables.leave_space(peer_id, self.activity_history);
        tables.peer_sockets.remove(peer_id);
        departure
    }

    /// Push each space's recent history to its members.
    pub async fn broadcast_activity(&self) -> usize {
        let tables = self.tables.read().await;
        let mut sent = 0;
        for (space_id, space) in &tables.spaces {
            if space.activity.is_empty() {
                continue;
            }
            let event = ServerEvent::SpaceActivity {
                events: space.activity.iter().cloned().collect(),
            };
            sent += tables.broadcast(space_id, None, &event);
        }
        sent
    }

    pub async fn connection_of(&self, peer_id: &str) -> Option<ConnectionId> {
        self.tables.read().await.peer_sockets.get(peer_id).map(|s| s.conn)
    }

    pub async fn space_of(&self, peer_id: &str) -> Option<String> {
        self.tables.read().await.peer_sockets.get(peer_id)?.space.clone()
    }

    pub async fn space_count(&self) -> usize {
        self.tables.read().await.spaces.len()
    }

    pub async fn members(&self, space_id: &str) -> Vec<PeerSummary> {
        self.tables
            .read()
            .await
            .spaces
            .get(space_id)
            .map(|s| s.peers.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn registry() -> PeerRegistry {
        PeerRegistry::new(SpawnRegion::default(), 4)
    }

    async fn connect(reg: &PeerRegistry, conn: ConnectionId) -> (PeerId, UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = unbounded_channel();
        let id = reg.connect(conn, tx).await;
        match rx.recv().await {
            Some(ServerEvent::Connected { peer_id }) => assert_eq!(peer_id, id),
            other => panic!("Expected connected, got {other:?}"),
        }
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_fresh_id_per_connect() {
        let reg = registry();
        let (a, _) = connect(&reg, 1).await;
        let (b, _) = connect(&reg, 1).await;
        assert_ne!(a, b);
        assert_eq!(reg.connection_of(&a).await, Some(1));
    }

    #[tokio::test]
    async fn test_join_sends_state_and_notifies_others() {
        let reg = registry();
        let (a, mut rx_a) = connect(&reg, 1).await;
        let (b, mut rx_b) = connect(&reg, 2).await;

        let summary = reg.join_space(&a, "demo", "Alice").await.unwrap();
        assert!((1800.0..=2200.0).contains(&summary.position.x));
        assert!((1800.0..=2200.0).contains(&summary.position.y));

        reg.join_space(&b, "demo", "Bob").await.unwrap();

        let for_b = drain(&mut rx_b);
        match &for_b[..] {
            [ServerEvent::SpaceState { peers }] => assert_eq!(peers.len(), 2),
            other => panic!("Unexpected events for joiner: {other:?}"),
        }
        let for_a = drain(&mut rx_a);
        assert!(for_a
            .iter()
            .any(|e| matches!(e, ServerEvent::PeerJoined { peer_id, username, .. } if *peer_id == b && username == "Bob")));
    }

    #[tokio::test]
    async fn test_signal_point_to_point() {
        let reg = registry();
        let (a, _rx_a) = connect(&reg, 1).await;
        let (b, mut rx_b) = connect(&reg, 2).await;
        let (_c, mut rx_c) = connect(&reg, 3).await;

        let sig = SignalPayload::Offer { sdp: "v=0".into() };
        assert!(reg.relay_signal(&a, &b, sig.clone()).await);

        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::Signal { to: b.clone(), from: a.clone(), signal: sig }]
        );
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_signal_to_unknown_dropped() {
        let reg = registry();
        let (a, _rx) = connect(&reg, 1).await;
        assert!(!reg.relay_signal(&a, "nobody", SignalPayload::Answer { sdp: String::new() }).await);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_and_deletes_empty_space() {
        let reg = registry();
        let (a, mut rx_a) = connect(&reg, 1).await;
        let (b, _rx_b) = connect(&reg, 2).await;
        reg.join_space(&a, "demo", "Alice").await;
        reg.join_space(&b, "demo", "Bob").await;
        drain(&mut rx_a);

        let dep = reg.disconnect(&b).await.unwrap();
        assert_eq!(dep.space_id, "demo");
        assert!(!dep.space_closed);
        assert_eq!(drain(&mut rx_a), vec![ServerEvent::PeerLeft { peer_id: b.clone() }]);
        assert_eq!(reg.connection_of(&b).await, None);

        let dep = reg.disconnect(&a).await.unwrap();
        assert!(dep.space_closed);
        assert_eq!(reg.space_count().await, 0);
        assert!(reg.disconnect(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_switching_spaces() {
        let reg = registry();
        let (a, _rx_a) = connect(&reg, 1).await;
        let (b, mut rx_b) = connect(&reg, 2).await;
        reg.join_space(&a, "one", "Alice").await;
        reg.join_space(&b, "one", "Bob").await;
        drain(&mut rx_b);

        reg.join_space(&a, "two", "Alice").await;
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::PeerLeft { peer_id: a.clone() }]);
        assert_eq!(reg.members("one").await.len(), 1);
        assert_eq!(reg.space_of(&a).await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_share_announcement_scoped_to_space() {
        let reg = registry();
        let (a, _rx_a) = connect(&reg, 1).await;
        let (b, mut rx_b) = connect(&reg, 2).await;
        let (c, mut rx_c) = connect(&reg, 3).await;
        reg.join_space(&a, "demo", "Alice").await;
        reg.join_space(&b, "demo", "Bob").await;
        reg.join_space(&c, "other", "Carol").await;
        drain(&mut rx_b);
        drain(&mut rx_c);

        assert_eq!(reg.announce_share(&a, "s1", true).await, 1);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::ScreenShareStarted { peer_id: a.clone(), share_id: "s1".into() }]
        );
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_space_info_has_no_side_effects() {
        let reg = registry();
        let (a, _rx_a) = connect(&reg, 1).await;
        let (b, mut rx_b) = connect(&reg, 2).await;
        reg.join_space(&a, "demo", "Alice").await;

        assert!(reg.space_info(&b, "demo").await);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::SpaceInfo {
                space_id: "demo".into(),
                exists: true,
                participants: vec!["Alice".into()],
            }]
        );
        reg.space_info(&b, "ghost-town").await;
        assert!(matches!(&drain(&mut rx_b)[..], [ServerEvent::SpaceInfo { exists: false, .. }]));
        assert_eq!(reg.space_count().await, 1);
        assert_eq!(reg.space_of(&b).await, None);
    }

    #[tokio::test]
    async fn test_activity_ring_bounded() {
        let reg = registry();
        let (a, mut rx_a) = connect(&reg, 1).await;
        reg.join_space(&a, "demo", "Alice").await;
        for i in 0..5 {
            let (p, _rx) = connect(&reg, 10 + i).await;
            reg.join_space(&p, "demo", &format!("guest{i}")).await;
        }
        drain(&mut rx_a);

        reg.broadcast_activity().await;
        let events = drain(&mut rx_a);
        match &events[..] {
            [ServerEvent::SpaceActivity { events }] => {
                assert_eq!(events.len(), 4);
                assert_eq!(events.last().map(|e| e.username.as_str()), Some("guest4"));
            }
            other => panic!("Expected one activity frame, got {other:?}"),
        }
    }
}
