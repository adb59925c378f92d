//! Client session: one context object per joined space.
//!
//! [`SpaceSession`] owns the signaling transport, the document provider,
//! the [`DocumentBridge`], the [`PeerOrchestrator`] and the
//! [`TrackClassifier`]. Every input (signaling events, sync frames,
//! media-engine callbacks) is serialized through [`SpaceSession::next_event`],
//! so the core state machines never see concurrent calls.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use plaza_core::{
    BridgeError, ChangeSet, Delta, DocumentBridge, LocalTrack, MediaEngine, MediaEvent,
    NegotiationOutcome, NoteStyle, OutgoingSignal, PeerEntry, PeerId, PeerOrchestrator, PeerState,
    ScreenShareEntry, SpaceDocument, TextNoteEntry, TrackAssignment, TrackClassifier,
};

use crate::channel::{ConnectionState, ReconnectPolicy, TransportError};
use crate::events::{ActivityEvent, ClientEvent, PeerSummary, ServerEvent};
use crate::provider::{DocumentProvider, ProviderEvent};
use crate::transport::{SignalingTransport, TransportEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub space_id: String,
    pub username: String,
    /// How long `join` waits for the relay to assign a peer id.
    pub connect_timeout: Duration,
    /// How long [`SpaceSession::wait_for_initial_sync`] waits before
    /// falling back to local state.
    pub sync_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub offline_queue_limit: usize,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, space_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            space_id: space_id.into(),
            username: username.into(),
            connect_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            offline_queue_limit: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Session has no peer id yet")]
    NotJoined,

    #[error("Session has left the space")]
    Left,
}

/// Everything the application layer needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionState),
    SyncConnection(ConnectionState),
    /// Relay assigned (or re-assigned) our id and `join-space` was sent.
    Joined { peer_id: PeerId },
    PeerIdChanged { old: PeerId, new: PeerId },
    SpaceState(Vec<PeerSummary>),
    PeerJoined(PeerSummary),
    PeerLeft(PeerId),
    Synced,
    DocumentChanged(ChangeSet),
    PeerConnection { peer_id: PeerId, state: PeerState },
    Track(TrackAssignment),
    ShareAnnounced { peer_id: PeerId, share_id: String },
    ShareStopped { peer_id: PeerId, share_id: String },
    SpaceInfo { space_id: String, exists: bool, participants: Vec<String> },
    SpaceActivity(Vec<ActivityEvent>),
    /// The signaling channel gave up reconnecting.
    Disconnected,
}

pub struct SpaceSession<E: MediaEngine> {
    config: SessionConfig,
    transport: SignalingTransport,
    provider: DocumentProvider,
    bridge: DocumentBridge,
    orchestrator: PeerOrchestrator<E>,
    classifier: TrackClassifier,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    heartbeat: Interval,
    pending: VecDeque<SessionEvent>,
    peer_id: Option<PeerId>,
    /// Local mirror of our own peer entry.
    local: PeerEntry,
    entry_written: bool,
    transport_done: bool,
    provider_done: bool,
    media_done: bool,
    left: bool,
}

impl<E: MediaEngine> SpaceSession<E> {
    /// Connect both channels and wait until the relay assigns a peer id.
    ///
    /// `media_events` is the receiving half of the channel the media
    /// engine reports candidates, connectivity and tracks on.
    pub async fn join(
        config: SessionConfig,
        engine: E,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Result<Self, SessionError> {
        let transport = SignalingTransport::connect(&config.server_url, config.reconnect.clone());
        let provider = DocumentProvider::connect(
            &config.server_url,
            &config.space_id,
            config.reconnect.clone(),
            config.offline_queue_limit,
        );
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session = Self {
            local: PeerEntry::new(config.username.clone(), 0.0, 0.0),
            config,
            transport,
            provider,
            bridge: DocumentBridge::new(),
            orchestrator: PeerOrchestrator::new(String::new(), engine),
            classifier: TrackClassifier::new(),
            media_events,
            heartbeat,
            pending: VecDeque::new(),
            peer_id: None,
            entry_written: false,
            transport_done: false,
            provider_done: false,
            media_done: false,
            left: false,
        };

        let timeout = session.config.connect_timeout;
        let deadline = Instant::now() + timeout;
        while session.peer_id.is_none() {
            match tokio::time::timeout_at(deadline, session.pump()).await {
                Ok(true) => {}
                Ok(false) => return Err(TransportError::Closed.into()),
                Err(_) => {
                    session.close_channels();
                    return Err(TransportError::Timeout(timeout).into());
                }
            }
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn bridge(&self) -> &DocumentBridge {
        &self.bridge
    }

    /// For registering observers.
    pub fn bridge_mut(&mut self) -> &mut DocumentBridge {
        &mut self.bridge
    }

    pub fn document(&self) -> &SpaceDocument {
        self.bridge.document()
    }

    pub fn orchestrator(&self) -> &PeerOrchestrator<E> {
        &self.orchestrator
    }

    pub fn classifier(&self) -> &TrackClassifier {
        &self.classifier
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn sync_state(&self) -> ConnectionState {
        self.provider.state()
    }

    pub fn is_synced(&self) -> bool {
        self.bridge.is_synced()
    }

    /// [`wait_for_sync`](Self::wait_for_sync) with the configured
    /// `sync_timeout`.
    pub async fn wait_for_initial_sync(&mut self) -> bool {
        let timeout = self.config.sync_timeout;
        self.wait_for_sync(timeout).await
    }

    /// Wait for the initial document exchange. After `timeout` the bridge
    /// is marked synced anyway so observers start firing. Returns whether
    /// the relay actually answered in time.
    pub async fn wait_for_sync(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.bridge.is_synced() {
            match tokio::time::timeout_at(deadline, self.pump()).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    log::warn!(
                        "Document sync for {} timed out after {:?}; continuing with local state",
                        self.config.space_id,
                        timeout
                    );
                    let changes = self.bridge.mark_synced();
                    self.push_synced(changes);
                    return false;
                }
            }
        }
        true
    }

    /// Next event for the application. `None` once every channel is gone.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if !self.pump().await {
                return None;
            }
        }
    }

    /// Handle one input. Returns false when nothing is left to wait on.
    async fn pump(&mut self) -> bool {
        if self.transport_done && self.provider_done {
            return false;
        }
        tokio::select! {
            event = self.transport.next_event(), if !self.transport_done => match event {
                Some(event) => self.on_transport(event),
                None => self.transport_done = true,
            },
            event = self.provider.recv(), if !self.provider_done => match event {
                Some(event) => {
                    if let Some(event) = self.provider.handle(event, &mut self.bridge) {
                        self.on_sync(event);
                    }
                }
                None => self.provider_done = true,
            },
            event = self.media_events.recv(), if !self.media_done => match event {
                Some(event) => self.on_media(event),
                None => self.media_done = true,
            },
            _ = self.heartbeat.tick() => {
                self.provider.ping();
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Input handlers
    // ---------------------------------------------------------------

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::State(state) => self.pending.push_back(SessionEvent::Connection(state)),
            TransportEvent::Opened { resumed } => {
                log::debug!("Signaling open (resumed: {resumed}), waiting for peer id");
            }
            TransportEvent::Closed { gave_up } => {
                if gave_up {
                    self.pending.push_back(SessionEvent::Disconnected);
                }
            }
            TransportEvent::Server(event) => self.on_server(event),
        }
    }

    fn on_server(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { peer_id } => self.on_connected(peer_id),
            ServerEvent::SpaceState { peers } => {
                self.write_own_entry(&peers);
                self.pending.push_back(SessionEvent::SpaceState(peers));
            }
            ServerEvent::PeerJoined { peer_id, username, position } => {
                if self.peer_id.as_deref() == Some(peer_id.as_str()) {
                    return;
                }
                // The newcomer missed our earlier announcements.
                for share_id in self.orchestrator.local_shares() {
                    self.emit(&ClientEvent::ScreenShareStarted { share_id });
                }
                match self.orchestrator.on_peer_joined(&peer_id) {
                    Ok(signals) => self.send_signals(signals),
                    Err(e) => log::warn!("Could not connect to {}: {}", peer_id, e),
                }
                self.pending.push_back(SessionEvent::PeerJoined(PeerSummary {
                    peer_id,
                    username,
                    position,
                }));
            }
            ServerEvent::PeerLeft { peer_id } => {
                if self.orchestrator.on_peer_left(&peer_id) {
                    self.pending.push_back(SessionEvent::PeerConnection {
                        peer_id: peer_id.clone(),
                        state: PeerState::Closed,
                    });
                }
                self.classifier.forget_peer(&peer_id);
                self.pending.push_back(SessionEvent::PeerLeft(peer_id));
            }
            ServerEvent::Signal { from, signal, .. } => match self.orchestrator.on_signal(&from, signal) {
                Ok(signals) => self.send_signals(signals),
                Err(e) => log::warn!("Negotiation with {} failed: {}", from, e),
            },
            ServerEvent::ScreenShareStarted { peer_id, share_id } => {
                self.classifier.announce(&peer_id, &share_id);
                self.pending.push_back(SessionEvent::ShareAnnounced { peer_id, share_id });
            }
            ServerEvent::ScreenShareStopped { peer_id, share_id } => {
                self.classifier.withdraw(&peer_id, &share_id);
                self.pending.push_back(SessionEvent::ShareStopped { peer_id, share_id });
            }
            ServerEvent::SpaceInfo { space_id, exists, participants } => {
                self.pending.push_back(SessionEvent::SpaceInfo { space_id, exists, participants });
            }
            ServerEvent::SpaceActivity { events } => {
                self.pending.push_back(SessionEvent::SpaceActivity(events));
            }
            ServerEvent::Error { message } => log::warn!("Relay error: {message}"),
        }
    }

    fn on_connected(&mut self, new_id: PeerId) {
        match self.peer_id.take() {
            Some(old_id) if old_id != new_id => {
                log::info!("Signaling reconnected as {} (was {})", new_id, old_id);
                self.orchestrator.set_local_id(new_id.clone());
                self.classifier.reset();
                self.bridge.set_local_peer(Some(new_id.clone()));
                if self.entry_written {
                    self.rehome_entries(&old_id, &new_id);
                }
                self.pending.push_back(SessionEvent::PeerIdChanged {
                    old: old_id,
                    new: new_id.clone(),
                });
            }
            _ => {
                log::info!("Signaling connected as {}", new_id);
                self.orchestrator.set_local_id(new_id.clone());
                self.bridge.set_local_peer(Some(new_id.clone()));
            }
        }
        self.peer_id = Some(new_id.clone());
        self.emit(&ClientEvent::JoinSpace {
            space_id: self.config.space_id.clone(),
            username: self.config.username.clone(),
        });
        for share_id in self.orchestrator.local_shares() {
            self.emit(&ClientEvent::ScreenShareStarted { share_id });
        }
        self.pending.push_back(SessionEvent::Joined { peer_id: new_id });
    }

    /// Move our peer entry and owned shares from `old` to `new`.
    fn rehome_entries(&mut self, old: &str, new: &str) {
        if let Some(delta) = self.bridge.remove_peer(old) {
            self.provider.send_update(delta);
        }
        let entry = self.local.clone();
        self.ship(|bridge| bridge.add_peer(new, &entry));

        for share_id in self.bridge.screen_shares_owned_by(old) {
            let share = match self.bridge.document().get::<ScreenShareEntry>(&share_id) {
                Ok(Some(share)) => share,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping unreadable screen-share {}: {}", share_id, e);
                    continue;
                }
            };
            // Fresh insert so a concurrent purge of the old owner cannot drop it.
            if let Some(delta) = self.bridge.remove_screen_share(&share_id) {
                self.provider.send_update(delta);
            }
            let share = ScreenShareEntry {
                peer_id: new.to_string(),
                ..share
            };
            self.ship(|bridge| bridge.add_screen_share(&share_id, &share));
        }
    }

    fn write_own_entry(&mut self, peers: &[PeerSummary]) {
        if self.entry_written {
            return;
        }
        let Some(own_id) = self.peer_id.clone() else {
            return;
        };
        if let Some(me) = peers.iter().find(|p| p.peer_id == own_id) {
            self.local.x = me.position.x;
            self.local.y = me.position.y;
        }
        let entry = self.local.clone();
        if self.ship(|bridge| bridge.add_peer(&own_id, &entry)) {
            self.entry_written = true;
        }
    }

    fn on_sync(&mut self, event: ProviderEvent) {
        match event {
            ProviderEvent::State(state) => self.pending.push_back(SessionEvent::SyncConnection(state)),
            ProviderEvent::Synced(changes) => self.push_synced(changes),
            ProviderEvent::Remote(changes) => self.pending.push_back(SessionEvent::DocumentChanged(changes)),
            ProviderEvent::Closed { gave_up } => {
                if gave_up {
                    log::error!("Document sync for {} gave up reconnecting", self.config.space_id);
                }
            }
        }
    }

    fn push_synced(&mut self, changes: ChangeSet) {
        self.pending.push_back(SessionEvent::Synced);
        if !changes.is_empty() {
            self.pending.push_back(SessionEvent::DocumentChanged(changes));
        }
    }

    fn on_media(&mut self, event: MediaEvent) {
        match self.orchestrator.handle_media_event(event) {
            NegotiationOutcome::Ignored => {}
            NegotiationOutcome::Signal(signal) => self.send_signals(vec![signal]),
            NegotiationOutcome::StateChanged { peer_id, state } => {
                if matches!(state, PeerState::Failed | PeerState::Closed) {
                    self.classifier.forget_peer(&peer_id);
                }
                self.pending.push_back(SessionEvent::PeerConnection { peer_id, state });
            }
            NegotiationOutcome::Track { peer_id, track } => {
                let assignment = self.classifier.classify(&peer_id, &track);
                self.pending.push_back(SessionEvent::Track(assignment));
            }
        }
    }

    // ---------------------------------------------------------------
    // Outbound helpers
    // ---------------------------------------------------------------

    fn emit(&self, event: &ClientEvent) {
        if let Err(e) = self.transport.emit(event) {
            log::debug!("Dropping signaling event while offline: {e}");
        }
    }

    fn send_signals(&self, signals: Vec<OutgoingSignal>) {
        for OutgoingSignal { to, signal } in signals {
            self.emit(&ClientEvent::Signal { to, signal });
        }
    }

    /// Run a bridge mutation and ship its delta. Logs and returns false on error.
    fn ship<F>(&mut self, mutate: F) -> bool
    where
        F: FnOnce(&mut DocumentBridge) -> Result<Delta, BridgeError>,
    {
        match mutate(&mut self.bridge) {
            Ok(delta) => {
                self.provider.send_update(delta);
                true
            }
            Err(e) => {
                log::warn!("Local document write failed: {e}");
                false
            }
        }
    }

    fn try_ship<F>(&mut self, mutate: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut DocumentBridge) -> Result<Delta, BridgeError>,
    {
        let delta = mutate(&mut self.bridge)?;
        self.provider.send_update(delta);
        Ok(())
    }

    fn own_id(&self) -> Result<PeerId, SessionError> {
        if self.left {
            return Err(SessionError::Left);
        }
        self.peer_id.clone().ok_or(SessionError::NotJoined)
    }

    // ---------------------------------------------------------------
    // Local operations
    // ---------------------------------------------------------------

    pub fn move_to(&mut self, x: f64, y: f64) -> Result<(), SessionError> {
        let id = self.own_id()?;
        self.local.x = x;
        self.local.y = y;
        self.try_ship(|bridge| bridge.update_peer_position(&id, x, y))
    }

    pub fn set_media_state(&mut self, is_muted: bool, is_video_off: bool) -> Result<(), SessionError> {
        let id = self.own_id()?;
        self.local.is_muted = is_muted;
        self.local.is_video_off = is_video_off;
        self.try_ship(|bridge| bridge.update_peer_media_state(&id, is_muted, is_video_off))
    }

    pub fn set_status(&mut self, status: &str) -> Result<(), SessionError> {
        let id = self.own_id()?;
        self.local.status = status.to_string();
        self.try_ship(|bridge| bridge.update_peer_status(&id, status))
    }

    /// Camera and microphone tracks sent to every peer.
    pub fn set_webcam_tracks(&mut self, tracks: Vec<LocalTrack>) -> Result<(), SessionError> {
        self.own_id()?;
        let signals = self.orchestrator.set_webcam_tracks(tracks);
        self.send_signals(signals);
        Ok(())
    }

    /// Publish a screen-share: document entry, announcement, then offers.
    pub fn start_screen_share(
        &mut self,
        tracks: Vec<LocalTrack>,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Result<String, SessionError> {
        let id = self.own_id()?;
        let share_id = plaza_core::new_entity_id();
        let entry = ScreenShareEntry {
            peer_id: id,
            username: self.config.username.clone(),
            x,
            y,
            width,
            height,
        };
        self.try_ship(|bridge| bridge.add_screen_share(&share_id, &entry))?;
        self.emit(&ClientEvent::ScreenShareStarted {
            share_id: share_id.clone(),
        });
        let signals = self.orchestrator.add_local_share(&share_id, tracks);
        self.send_signals(signals);
        Ok(share_id)
    }

    pub fn stop_screen_share(&mut self, share_id: &str) -> Result<(), SessionError> {
        self.own_id()?;
        let signals = self.orchestrator.remove_local_share(share_id);
        self.send_signals(signals);
        if let Some(delta) = self.bridge.remove_screen_share(share_id) {
            self.provider.send_update(delta);
        }
        self.emit(&ClientEvent::ScreenShareStopped {
            share_id: share_id.to_string(),
        });
        Ok(())
    }

    pub fn move_screen_share(&mut self, share_id: &str, x: f64, y: f64) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.update_screen_share_position(share_id, x, y))
    }

    pub fn resize_screen_share(&mut self, share_id: &str, width: f64, height: f64) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.update_screen_share_size(share_id, width, height))
    }

    pub fn add_text_note(&mut self, x: f64, y: f64) -> Result<String, SessionError> {
        self.own_id()?;
        let note_id = plaza_core::new_entity_id();
        let entry = TextNoteEntry::new(x, y);
        self.try_ship(|bridge| bridge.add_text_note(&note_id, &entry))?;
        Ok(note_id)
    }

    pub fn move_text_note(&mut self, note_id: &str, x: f64, y: f64) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.update_text_note_position(note_id, x, y))
    }

    pub fn resize_text_note(&mut self, note_id: &str, width: f64, height: f64) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.update_text_note_size(note_id, width, height))
    }

    pub fn style_text_note(&mut self, note_id: &str, style: &NoteStyle) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.update_text_note_style(note_id, style))
    }

    pub fn insert_note_text(&mut self, note_id: &str, index: u32, chunk: &str) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.insert_note_text(note_id, index, chunk))
    }

    pub fn delete_note_text(&mut self, note_id: &str, index: u32, len: u32) -> Result<(), SessionError> {
        self.own_id()?;
        self.try_ship(|bridge| bridge.delete_note_text(note_id, index, len))
    }

    pub fn remove_text_note(&mut self, note_id: &str) -> Result<(), SessionError> {
        self.own_id()?;
        for delta in self.bridge.remove_text_note(note_id) {
            self.provider.send_update(delta);
        }
        Ok(())
    }

    /// Ask the relay who is in `space_id`. The answer arrives as
    /// [`SessionEvent::SpaceInfo`].
    pub fn request_space_info(&self, space_id: &str) -> Result<(), SessionError> {
        self.transport.emit(&ClientEvent::GetSpaceInfo {
            space_id: space_id.to_string(),
        })?;
        Ok(())
    }

    /// Leave the space. Completes synchronously: our entries are removed,
    /// every peer connection is closed, local captures are stopped and
    /// both channels are shut.
    pub fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;

        if let Some(id) = self.peer_id.clone() {
            for share_id in self.bridge.screen_shares_owned_by(&id) {
                if let Some(delta) = self.bridge.remove_screen_share(&share_id) {
                    self.provider.send_update(delta);
                }
            }
            if let Some(delta) = self.bridge.remove_peer(&id) {
                self.provider.send_update(delta);
            }
        }
        self.orchestrator.shutdown();
        self.classifier.reset();
        self.close_channels();
        log::info!("Left space {}", self.config.space_id);
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    fn close_channels(&mut self) {
        self.transport.close();
        self.provider.close();
    }
}

impl<E: MediaEngine> Drop for SpaceSession<E> {
    fn drop(&mut self) {
        self.leave();
    }
}
