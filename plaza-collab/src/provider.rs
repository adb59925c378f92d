//! Document sync channel client.
//!
//! Connects a [`DocumentBridge`] to the relay's `/doc/{space}` room and
//! runs the two-way state-vector handshake on every (re)connect. Local
//! updates produced while offline are queued and replayed.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::mpsc;

use plaza_core::{ChangeSet, Delta, DocumentBridge};

use crate::channel::{Channel, ChannelEvent, ConnectionState, ReconnectPolicy};
use crate::protocol::{MessageType, SyncMessage};

/// Offline queue for updates made while disconnected.
///
/// Queued updates are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false if the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            clock,
            payload,
            queued_at: Instant::now(),
        });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }

    /// How long the oldest update has been waiting.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|u| u.queued_at.elapsed())
    }
}

/// Outcome of handling one sync-channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    State(ConnectionState),
    /// Initial exchange with the relay completed; carries the first
    /// full reconcile.
    Synced(ChangeSet),
    Remote(ChangeSet),
    Closed { gave_up: bool },
}

/// `ws://host:port` + `demo` → `ws://host:port/doc/demo`
pub fn doc_url(base: &str, space_id: &str) -> String {
    format!("{}/doc/{}", base.trim_end_matches('/'), space_id)
}

pub struct DocumentProvider {
    space_id: String,
    channel: Channel,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    queue: OfflineQueue,
    clock: u64,
}

impl DocumentProvider {
    pub fn connect(base_url: &str, space_id: &str, policy: ReconnectPolicy, queue_limit: usize) -> Self {
        let (channel, events) = Channel::open(doc_url(base_url, space_id), policy);
        Self {
            space_id: space_id.to_string(),
            channel,
            events,
            queue: OfflineQueue::new(queue_limit),
            clock: 0,
        }
    }

    pub fn space_id(&self) -> &str {
        &self.space_id
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn send(&self, msg: &SyncMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => self.channel.send_binary(bytes).is_ok(),
            Err(e) => {
                log::error!("Failed to encode sync message: {e}");
                false
            }
        }
    }

    /// Ship a local update, or queue it if the channel is down.
    pub fn send_update(&mut self, delta: Delta) {
        self.clock += 1;
        let msg = SyncMessage::update(&self.space_id, self.clock, delta);
        if self.send(&msg) {
            return;
        }
        if !self.queue.enqueue(self.clock, msg.payload) {
            // The next handshake still carries this update via the diff.
            log::warn!("Offline queue full ({}), dropping update", self.queue.len());
        }
    }

    pub fn ping(&self) -> bool {
        self.send(&SyncMessage::ping(&self.space_id))
    }

    /// Next raw channel event. Cancel-safe.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Apply one channel event to the bridge.
    pub fn handle(&mut self, event: ChannelEvent, bridge: &mut DocumentBridge) -> Option<ProviderEvent> {
        match event {
            ChannelEvent::State(s) => Some(ProviderEvent::State(s)),
            ChannelEvent::Closed { gave_up } => Some(ProviderEvent::Closed { gave_up }),
            ChannelEvent::Opened { resumed } => {
                log::debug!("Sync channel for {} open (resumed: {resumed})", self.space_id);
                self.send(&SyncMessage::sync_step1(&self.space_id, bridge.state_vector()));
                let queued = self.queue.drain();
                if !queued.is_empty() {
                    log::info!("Replaying {} queued updates", queued.len());
                    for (clock, payload) in queued {
                        self.send(&SyncMessage::update(&self.space_id, clock, payload));
                    }
                }
                None
            }
            ChannelEvent::Text(_) => {
                log::debug!("Ignoring text frame on sync channel");
                None
            }
            ChannelEvent::Binary(bytes) => self.handle_frame(&bytes, bridge),
        }
    }

    fn handle_frame(&mut self, bytes: &[u8], bridge: &mut DocumentBridge) -> Option<ProviderEvent> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping sync frame: {e}");
                return None;
            }
        };

        match msg.msg_type {
            MessageType::SyncStep2 | MessageType::Update => {
                let changes = match bridge.apply_remote(&msg.payload) {
                    Ok(changes) => changes,
                    Err(e) => {
                        log::warn!("Rejected remote update: {e}");
                        return None;
                    }
                };
                if msg.msg_type == MessageType::SyncStep2 && !bridge.is_synced() {
                    log::info!("Document for {} synced", self.space_id);
                    return Some(ProviderEvent::Synced(bridge.mark_synced()));
                }
                (!changes.is_empty()).then_some(ProviderEvent::Remote(changes))
            }
            MessageType::SyncStep1 => {
                match bridge.diff(&msg.payload) {
                    Ok(diff) => {
                        self.send(&SyncMessage::sync_step2(&self.space_id, diff));
                    }
                    Err(e) => log::warn!("Bad state vector from relay: {e}"),
                }
                None
            }
            MessageType::Ping => {
                self.send(&SyncMessage::pong(&self.space_id));
                None
            }
            MessageType::Pong => {
                log::trace!("Pong from relay");
                None
            }
        }
    }

    pub fn close(&self) {
        self.channel.close();
    }
}
