//! CRDT → application state bridge.
//!
//! Keeps a local projection of each replicated map and republishes it as
//! immutable snapshots. Every published snapshot is a fresh `Arc`, so a
//! consumer can detect change by pointer identity alone.
//!
//! ```text
//!  local mutation ──▸ SpaceDocument ──▸ Delta (returned to caller)
//!        │
//!        └──▸ projection patch ──▸ observers
//!
//!  remote Delta ──▸ SpaceDocument::apply_update ──▸ reconcile ──▸ observers
//!                                                  (add / update / remove)
//! ```
//!
//! Until the initial sync with the relay completes the document may be
//! partial, so remote updates are integrated silently and nothing is
//! diffed or published. [`DocumentBridge::mark_synced`] performs the first
//! full reconcile and releases the observers.
//!
//! The local peer's own entry is write-only from the bridge's point of
//! view: remote reconciles never touch it, so relay echoes cannot fight
//! optimistic local state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::document::{DocumentError, SpaceDocument};
use crate::{
    Collection, Delta, Entity, FieldValue, FontFamily, FontSize, PeerEntry, PeerId,
    ScreenShareEntry, TextNoteEntry, MIN_NOTE_HEIGHT, MIN_NOTE_WIDTH, MIN_SHARE_HEIGHT,
    MIN_SHARE_WIDTH,
};

/// Immutable view of one replicated map.
pub type Snapshot<T> = Arc<BTreeMap<String, T>>;

type Observer<T> = Box<dyn FnMut(&Snapshot<T>) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("No {collection} entry with id {id}")]
    UnknownEntity { collection: &'static str, id: String },
}

/// One reconciled difference between the projection and the document.
#[derive(Clone, Debug, PartialEq)]
pub enum Change<T> {
    Added { id: String, entry: T },
    Updated { id: String, entry: T },
    Removed { id: String },
}

impl<T> Change<T> {
    pub fn id(&self) -> &str {
        match self {
            Change::Added { id, .. } | Change::Updated { id, .. } | Change::Removed { id } => id,
        }
    }
}

/// Everything a reconcile pass changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub peers: Vec<Change<PeerEntry>>,
    pub screen_shares: Vec<Change<ScreenShareEntry>>,
    pub text_notes: Vec<Change<TextNoteEntry>>,
    /// Notes whose body text changed.
    pub note_bodies: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
            && self.screen_shares.is_empty()
            && self.text_notes.is_empty()
            && self.note_bodies.is_empty()
    }
}

/// Partial style update for a text note.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NoteStyle {
    pub font_size: Option<FontSize>,
    pub font_family: Option<FontFamily>,
    pub color: Option<String>,
}

struct Projection<T> {
    entries: BTreeMap<String, T>,
    snapshot: Snapshot<T>,
    observers: Vec<Observer<T>>,
}

impl<T: Entity> Projection<T> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            snapshot: Arc::new(BTreeMap::new()),
            observers: Vec::new(),
        }
    }

    /// Diff `fresh` against the projection, skipping `pinned`.
    fn reconcile(&mut self, fresh: BTreeMap<String, T>, pinned: Option<&str>) -> Vec<Change<T>> {
        let mut changes = Vec::new();

        let removed: Vec<String> = self
            .entries
            .keys()
            .filter(|id| Some(id.as_str()) != pinned && !fresh.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.entries.remove(&id);
            changes.push(Change::Removed { id });
        }

        for (id, entry) in fresh {
            if Some(id.as_str()) == pinned {
                continue;
            }
            match self.entries.get(&id) {
                None => {
                    self.entries.insert(id.clone(), entry.clone());
                    changes.push(Change::Added { id, entry });
                }
                Some(existing) if *existing != entry => {
                    self.entries.insert(id.clone(), entry.clone());
                    changes.push(Change::Updated { id, entry });
                }
                Some(_) => {}
            }
        }

        changes
    }

    /// Patch a single entry from a local write.
    fn patch(&mut self, id: &str, entry: Option<T>) -> Option<Change<T>> {
        match entry {
            Some(entry) => match self.entries.insert(id.to_string(), entry.clone()) {
                None => Some(Change::Added { id: id.to_string(), entry }),
                Some(old) if old != entry => Some(Change::Updated { id: id.to_string(), entry }),
                Some(_) => None,
            },
            None => self
                .entries
                .remove(id)
                .map(|_| Change::Removed { id: id.to_string() }),
        }
    }

    fn publish(&mut self) {
        self.snapshot = Arc::new(self.entries.clone());
        for observer in &mut self.observers {
            observer(&self.snapshot);
        }
    }
}

/// Bridges a [`SpaceDocument`] to snapshot observers and exposes the
/// typed mutation API used by the UI.
pub struct DocumentBridge {
    doc: SpaceDocument,
    local_peer: Option<PeerId>,
    synced: bool,
    peers: Projection<PeerEntry>,
    screen_shares: Projection<ScreenShareEntry>,
    text_notes: Projection<TextNoteEntry>,
    note_bodies: HashMap<String, String>,
}

impl Default for DocumentBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentBridge {
    pub fn new() -> Self {
        Self::with_document(SpaceDocument::new())
    }

    pub fn with_document(doc: SpaceDocument) -> Self {
        Self {
            doc,
            local_peer: None,
            synced: false,
            peers: Projection::new(),
            screen_shares: Projection::new(),
            text_notes: Projection::new(),
            note_bodies: HashMap::new(),
        }
    }

    pub fn document(&self) -> &SpaceDocument {
        &self.doc
    }

    pub fn local_peer(&self) -> Option<&str> {
        self.local_peer.as_deref()
    }

    /// Set which peer entry is owned by this client.
    pub fn set_local_peer(&mut self, peer_id: Option<PeerId>) {
        self.local_peer = peer_id;
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    // ---------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.state_vector()
    }

    pub fn diff(&self, remote_sv: &[u8]) -> Result<Delta, BridgeError> {
        Ok(self.doc.diff(remote_sv)?)
    }

    /// Integrate a remote update and publish whatever it changed.
    pub fn apply_remote(&mut self, update: &[u8]) -> Result<ChangeSet, BridgeError> {
        self.doc.apply_update(update)?;
        if !self.synced {
            return Ok(ChangeSet::default());
        }
        Ok(self.reconcile())
    }

    /// Mark the initial sync complete. The first call reconciles the whole
    /// document and fires every observer once; later calls are no-ops.
    pub fn mark_synced(&mut self) -> ChangeSet {
        if self.synced {
            return ChangeSet::default();
        }
        self.synced = true;
        let changes = self.reconcile();
        // Observers registered before sync still expect one initial call.
        if changes.peers.is_empty() {
            self.peers.publish();
        }
        if changes.screen_shares.is_empty() {
            self.screen_shares.publish();
        }
        if changes.text_notes.is_empty() {
            self.text_notes.publish();
        }
        changes
    }

    fn reconcile(&mut self) -> ChangeSet {
        let pinned = self.local_peer.clone();
        let changes = ChangeSet {
            peers: self
                .peers
                .reconcile(self.doc.entries::<PeerEntry>(), pinned.as_deref()),
            screen_shares: self
                .screen_shares
                .reconcile(self.doc.entries::<ScreenShareEntry>(), None),
            text_notes: self
                .text_notes
                .reconcile(self.doc.entries::<TextNoteEntry>(), None),
            note_bodies: self.reconcile_bodies(),
        };

        if !changes.peers.is_empty() {
            self.peers.publish();
        }
        if !changes.screen_shares.is_empty() {
            self.screen_shares.publish();
        }
        if !changes.text_notes.is_empty() {
            self.text_notes.publish();
        }
        changes
    }

    fn reconcile_bodies(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        let live: Vec<String> = self.text_notes.entries.keys().cloned().collect();
        self.note_bodies.retain(|id, _| live.contains(id));
        for id in live {
            let body = self.doc.note_text(&id);
            if self.note_bodies.get(&id) != Some(&body) {
                self.note_bodies.insert(id.clone(), body);
                changed.push(id);
            }
        }
        changed
    }

    // ---------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------

    /// Fires now with the current peers (if synced) and on every change.
    pub fn observe_peers<F>(&mut self, mut callback: F)
    where
        F: FnMut(&Snapshot<PeerEntry>) + Send + 'static,
    {
        if self.synced {
            callback(&self.peers.snapshot);
        }
        self.peers.observers.push(Box::new(callback));
    }

    pub fn observe_screen_shares<F>(&mut self, mut callback: F)
    where
        F: FnMut(&Snapshot<ScreenShareEntry>) + Send + 'static,
    {
        if self.synced {
            callback(&self.screen_shares.snapshot);
        }
        self.screen_shares.observers.push(Box::new(callback));
    }

    pub fn observe_text_notes<F>(&mut self, mut callback: F)
    where
        F: FnMut(&Snapshot<TextNoteEntry>) + Send + 'static,
    {
        if self.synced {
            callback(&self.text_notes.snapshot);
        }
        self.text_notes.observers.push(Box::new(callback));
    }

    pub fn peers(&self) -> Snapshot<PeerEntry> {
        self.peers.snapshot.clone()
    }

    pub fn screen_shares(&self) -> Snapshot<ScreenShareEntry> {
        self.screen_shares.snapshot.clone()
    }

    pub fn text_notes(&self) -> Snapshot<TextNoteEntry> {
        self.text_notes.snapshot.clone()
    }

    pub fn note_text(&self, note_id: &str) -> String {
        self.doc.note_text(note_id)
    }

    // ---------------------------------------------------------------
    // Local writes
    // ---------------------------------------------------------------

    fn write<E: Entity>(
        &mut self,
        id: &str,
        fields: &[(&str, FieldValue)],
        project: fn(&mut Self) -> &mut Projection<E>,
    ) -> Result<Delta, BridgeError> {
        let delta = self.doc.set(E::COLLECTION, id, fields);
        // The write is already in the document; the delta must reach the wire.
        let entry = self.doc.get::<E>(id).unwrap_or_else(|e| {
            log::warn!("Dropping malformed {} entry {id}: {e}", E::COLLECTION.map_name());
            None
        });
        let synced = self.synced;
        let projection = project(self);
        if projection.patch(id, entry).is_some() && synced {
            projection.publish();
        }
        Ok(delta)
    }

    fn update<E: Entity>(
        &mut self,
        id: &str,
        fields: &[(&str, FieldValue)],
        project: fn(&mut Self) -> &mut Projection<E>,
    ) -> Result<Delta, BridgeError> {
        if !self.doc.contains(E::COLLECTION, id) {
            return Err(BridgeError::UnknownEntity {
                collection: E::COLLECTION.map_name(),
                id: id.to_string(),
            });
        }
        self.write(id, fields, project)
    }

    fn remove<E: Entity>(
        &mut self,
        id: &str,
        project: fn(&mut Self) -> &mut Projection<E>,
    ) -> Option<Delta> {
        let delta = self.doc.delete(E::COLLECTION, id);
        let synced = self.synced;
        let projection = project(self);
        if projection.patch(id, None).is_some() && synced {
            projection.publish();
        }
        delta
    }

    fn peer_projection(&mut self) -> &mut Projection<PeerEntry> {
        &mut self.peers
    }

    fn share_projection(&mut self) -> &mut Projection<ScreenShareEntry> {
        &mut self.screen_shares
    }

    fn note_projection(&mut self) -> &mut Projection<TextNoteEntry> {
        &mut self.text_notes
    }

    pub fn add_peer(&mut self, peer_id: &str, entry: &PeerEntry) -> Result<Delta, BridgeError> {
        self.write(peer_id, &entry.to_fields(), Self::peer_projection)
    }

    /// Returns `None` if the peer had no entry.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<Delta> {
        self.remove(peer_id, Self::peer_projection)
    }

    pub fn update_peer_position(&mut self, peer_id: &str, x: f64, y: f64) -> Result<Delta, BridgeError> {
        self.update(peer_id, &[("x", x.into()), ("y", y.into())], Self::peer_projection)
    }

    pub fn update_peer_media_state(
        &mut self,
        peer_id: &str,
        is_muted: bool,
        is_video_off: bool,
    ) -> Result<Delta, BridgeError> {
        self.update(
            peer_id,
            &[("isMuted", is_muted.into()), ("isVideoOff", is_video_off.into())],
            Self::peer_projection,
        )
    }

    pub fn update_peer_status(&mut self, peer_id: &str, status: &str) -> Result<Delta, BridgeError> {
        self.update(peer_id, &[("status", status.into())], Self::peer_projection)
    }

    pub fn add_screen_share(
        &mut self,
        share_id: &str,
        entry: &ScreenShareEntry,
    ) -> Result<Delta, BridgeError> {
        let mut entry = entry.clone();
        entry.width = entry.width.max(MIN_SHARE_WIDTH);
        entry.height = entry.height.max(MIN_SHARE_HEIGHT);
        self.write(share_id, &entry.to_fields(), Self::share_projection)
    }

    pub fn remove_screen_share(&mut self, share_id: &str) -> Option<Delta> {
        self.remove(share_id, Self::share_projection)
    }

    pub fn update_screen_share_position(
        &mut self,
        share_id: &str,
        x: f64,
        y: f64,
    ) -> Result<Delta, BridgeError> {
        self.update(share_id, &[("x", x.into()), ("y", y.into())], Self::share_projection)
    }

    pub fn update_screen_share_size(
        &mut self,
        share_id: &str,
        width: f64,
        height: f64,
    ) -> Result<Delta, BridgeError> {
        self.update(
            share_id,
            &[
                ("width", width.max(MIN_SHARE_WIDTH).into()),
                ("height", height.max(MIN_SHARE_HEIGHT).into()),
            ],
            Self::share_projection,
        )
    }

    /// Ids of screen-shares owned by `peer_id`, straight from the document.
    pub fn screen_shares_owned_by(&self, peer_id: &str) -> Vec<String> {
        self.doc
            .entries::<ScreenShareEntry>()
            .into_iter()
            .filter(|(_, share)| share.peer_id == peer_id)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn add_text_note(&mut self, note_id: &str, entry: &TextNoteEntry) -> Result<Delta, BridgeError> {
        let mut entry = entry.clone();
        entry.width = entry.width.max(MIN_NOTE_WIDTH);
        entry.height = entry.height.max(MIN_NOTE_HEIGHT);
        self.write(note_id, &entry.to_fields(), Self::note_projection)
    }

    /// Deletes the note and empties its body. Returns one delta per
    /// transaction that actually changed something.
    pub fn remove_text_note(&mut self, note_id: &str) -> Vec<Delta> {
        let mut deltas = Vec::new();
        if let Some(delta) = self.doc.clear_text(note_id) {
            deltas.push(delta);
        }
        if let Some(delta) = self.remove(note_id, Self::note_projection) {
            deltas.push(delta);
        }
        self.note_bodies.remove(note_id);
        deltas
    }

    pub fn update_text_note_position(
        &mut self,
        note_id: &str,
        x: f64,
        y: f64,
    ) -> Result<Delta, BridgeError> {
        self.update(note_id, &[("x", x.into()), ("y", y.into())], Self::note_projection)
    }

    pub fn update_text_note_size(
        &mut self,
        note_id: &str,
        width: f64,
        height: f64,
    ) -> Result<Delta, BridgeError> {
        self.update(
            note_id,
            &[
                ("width", width.max(MIN_NOTE_WIDTH).into()),
                ("height", height.max(MIN_NOTE_HEIGHT).into()),
            ],
            Self::note_projection,
        )
    }

    pub fn update_text_note_style(
        &mut self,
        note_id: &str,
        style: &NoteStyle,
    ) -> Result<Delta, BridgeError> {
        let mut fields: Vec<(&str, FieldValue)> = Vec::new();
        if let Some(size) = style.font_size {
            fields.push(("fontSize", size.as_str().into()));
        }
        if let Some(family) = style.font_family {
            fields.push(("fontFamily", family.as_str().into()));
        }
        if let Some(color) = &style.color {
            fields.push(("color", color.clone().into()));
        }
        self.update(note_id, &fields, Self::note_projection)
    }

    pub fn insert_note_text(&mut self, note_id: &str, index: u32, chunk: &str) -> Result<Delta, BridgeError> {
        self.ensure_note(note_id)?;
        let delta = self.doc.insert_text(note_id, index, chunk);
        self.note_bodies.insert(note_id.to_string(), self.doc.note_text(note_id));
        Ok(delta)
    }

    pub fn delete_note_text(&mut self, note_id: &str, index: u32, len: u32) -> Result<Delta, BridgeError> {
        self.ensure_note(note_id)?;
        let delta = self.doc.delete_text(note_id, index, len);
        self.note_bodies.insert(note_id.to_string(), self.doc.note_text(note_id));
        Ok(delta)
    }

    fn ensure_note(&self, note_id: &str) -> Result<(), BridgeError> {
        if self.doc.contains(Collection::TextNotes, note_id) {
            Ok(())
        } else {
            Err(BridgeError::UnknownEntity {
                collection: Collection::TextNotes.map_name(),
                id: note_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn synced_bridge(local: &str) -> DocumentBridge {
        let mut bridge = DocumentBridge::new();
        bridge.set_local_peer(Some(local.to_string()));
        bridge.mark_synced();
        bridge
    }

    fn share(owner: &str, w: f64, h: f64) -> ScreenShareEntry {
        ScreenShareEntry {
            peer_id: owner.into(),
            username: owner.into(),
            x: 0.0,
            y: 0.0,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_observer_gated_on_sync() {
        let mut bridge = DocumentBridge::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        bridge.observe_peers(move |snap| sink.lock().unwrap().push(snap.len()));

        let remote = SpaceDocument::new();
        let delta = remote.set(Collection::Peers, "p2", &PeerEntry::new("Bob", 0.0, 0.0).to_fields());
        let changes = bridge.apply_remote(&delta).unwrap();
        assert!(changes.is_empty());
        assert!(calls.lock().unwrap().is_empty());

        let changes = bridge.mark_synced();
        assert_eq!(changes.peers.len(), 1);
        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_observer_fires_immediately_once_synced() {
        let mut bridge = synced_bridge("p1");
        bridge.add_peer("p1", &PeerEntry::new("Alice", 0.0, 0.0)).unwrap();

        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        bridge.observe_peers(move |_| *sink.lock().unwrap() += 1);
        assert_eq!(*calls.lock().unwrap(), 1);

        bridge.update_peer_position("p1", 5.0, 5.0).unwrap();
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn test_empty_sync_still_fires_observer() {
        let mut bridge = DocumentBridge::new();
        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        bridge.observe_text_notes(move |snap| {
            assert!(snap.is_empty());
            *sink.lock().unwrap() += 1;
        });
        bridge.mark_synced();
        bridge.mark_synced();
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_reconcile_add_update_remove() {
        let mut bridge = synced_bridge("p1");
        let remote = SpaceDocument::new();

        let add = remote.set(Collection::Peers, "p2", &PeerEntry::new("Bob", 1.0, 1.0).to_fields());
        let changes = bridge.apply_remote(&add).unwrap();
        assert!(matches!(&changes.peers[..], [Change::Added { id, .. }] if id == "p2"));

        let moved = remote.set(Collection::Peers, "p2", &[("x", 500.0.into())]);
        let changes = bridge.apply_remote(&moved).unwrap();
        match &changes.peers[..] {
            [Change::Updated { id, entry }] => {
                assert_eq!(id, "p2");
                assert_eq!(entry.x, 500.0);
            }
            other => panic!("Expected one update, got {other:?}"),
        }

        let gone = remote.delete(Collection::Peers, "p2").unwrap();
        let changes = bridge.apply_remote(&gone).unwrap();
        assert_eq!(changes.peers, vec![Change::Removed { id: "p2".into() }]);
        assert!(bridge.peers().is_empty());
    }

    #[test]
    fn test_snapshot_identity_changes_only_on_change() {
        let mut bridge = synced_bridge("p1");
        let remote = SpaceDocument::new();
        let add = remote.set(Collection::Peers, "p2", &PeerEntry::new("Bob", 1.0, 1.0).to_fields());
        bridge.apply_remote(&add).unwrap();

        let before = bridge.peers();
        // Re-applying the same update is a no-op.
        bridge.apply_remote(&add).unwrap();
        assert!(Arc::ptr_eq(&before, &bridge.peers()));

        let moved = remote.set(Collection::Peers, "p2", &[("y", 3.0.into())]);
        bridge.apply_remote(&moved).unwrap();
        assert!(!Arc::ptr_eq(&before, &bridge.peers()));
    }

    #[test]
    fn test_local_peer_ignores_remote_echo() {
        let mut bridge = synced_bridge("p1");
        bridge.add_peer("p1", &PeerEntry::new("Alice", 0.0, 0.0)).unwrap();
        bridge.update_peer_position("p1", 10.0, 10.0).unwrap();

        // A stale remote write to our own entry must not override the
        // locally predicted position in the projection.
        let remote = SpaceDocument::new();
        remote.apply_update(&bridge.document().full_state()).unwrap();
        let stale = remote.set(Collection::Peers, "p1", &[("x", 1.0.into())]);
        let changes = bridge.apply_remote(&stale).unwrap();

        assert!(changes.peers.is_empty());
        assert_eq!(bridge.peers()["p1"].x, 10.0);
    }

    #[test]
    fn test_remove_peer_only_that_peer() {
        let mut bridge = synced_bridge("p1");
        bridge.add_peer("p1", &PeerEntry::new("Alice", 0.0, 0.0)).unwrap();
        bridge.add_peer("p2", &PeerEntry::new("Bob", 0.0, 0.0)).unwrap();
        bridge.add_peer("p3", &PeerEntry::new("Carol", 0.0, 0.0)).unwrap();

        assert!(bridge.remove_peer("p2").is_some());
        assert!(bridge.remove_peer("p2").is_none());
        assert_eq!(bridge.peers().len(), 2);
        assert!(bridge.peers().contains_key("p1"));
        assert!(bridge.peers().contains_key("p3"));
    }

    #[test]
    fn test_update_unknown_entity_fails() {
        let mut bridge = synced_bridge("p1");
        match bridge.update_peer_status("ghost", "hi") {
            Err(BridgeError::UnknownEntity { collection, id }) => {
                assert_eq!(collection, "peers");
                assert_eq!(id, "ghost");
            }
            other => panic!("Expected UnknownEntity, got {other:?}"),
        }
        assert!(bridge.insert_note_text("nope", 0, "x").is_err());
    }

    #[test]
    fn test_screen_share_minimum_size() {
        let mut bridge = synced_bridge("p1");
        bridge.add_screen_share("s1", &share("p1", 100.0, 50.0)).unwrap();
        let s = &bridge.screen_shares()["s1"];
        assert_eq!((s.width, s.height), (MIN_SHARE_WIDTH, MIN_SHARE_HEIGHT));

        bridge.update_screen_share_size("s1", 800.0, 10.0).unwrap();
        let s = &bridge.screen_shares()["s1"];
        assert_eq!((s.width, s.height), (800.0, MIN_SHARE_HEIGHT));
    }

    #[test]
    fn test_screen_shares_owned_by() {
        let mut bridge = synced_bridge("p1");
        bridge.add_screen_share("s1", &share("p1", 640.0, 480.0)).unwrap();
        bridge.add_screen_share("s2", &share("p2", 640.0, 480.0)).unwrap();
        bridge.add_screen_share("s3", &share("p1", 640.0, 480.0)).unwrap();

        assert_eq!(bridge.screen_shares_owned_by("p1"), vec!["s1".to_string(), "s3".to_string()]);
    }

    #[test]
    fn test_note_style_partial_update() {
        let mut bridge = synced_bridge("p1");
        bridge.add_text_note("n1", &TextNoteEntry::new(0.0, 0.0)).unwrap();
        bridge
            .update_text_note_style(
                "n1",
                &NoteStyle {
                    font_family: Some(FontFamily::Mono),
                    ..NoteStyle::default()
                },
            )
            .unwrap();

        let note = &bridge.text_notes()["n1"];
        assert_eq!(note.font_family, FontFamily::Mono);
        assert_eq!(note.font_size, FontSize::Medium);
    }

    #[test]
    fn test_note_body_changes_reported() {
        let mut bridge = synced_bridge("p1");
        let remote = SpaceDocument::new();
        let add = remote.set(Collection::TextNotes, "n1", &TextNoteEntry::new(0.0, 0.0).to_fields());
        bridge.apply_remote(&add).unwrap();

        let typed = remote.insert_text("n1", 0, "hi");
        let changes = bridge.apply_remote(&typed).unwrap();
        assert_eq!(changes.note_bodies, vec!["n1".to_string()]);
        assert_eq!(bridge.note_text("n1"), "hi");
    }

    #[test]
    fn test_remove_text_note_clears_body() {
        let mut bridge = synced_bridge("p1");
        bridge.add_text_note("n1", &TextNoteEntry::new(0.0, 0.0)).unwrap();
        bridge.insert_note_text("n1", 0, "scratch").unwrap();

        let deltas = bridge.remove_text_note("n1");
        assert_eq!(deltas.len(), 2);
        assert!(bridge.text_notes().is_empty());
        assert_eq!(bridge.note_text("n1"), "");

        let mirror = SpaceDocument::new();
        mirror.apply_update(&bridge.document().full_state()).unwrap();
        assert_eq!(mirror.len(Collection::TextNotes), 0);
    }

    #[test]
    fn test_write_to_malformed_entry_still_returns_delta() {
        let remote = SpaceDocument::new();
        let mut fields = TextNoteEntry::new(10.0, 10.0).to_fields();
        for (key, value) in fields.iter_mut() {
            if *key == "fontSize" {
                *value = "huge".into();
            }
        }
        remote.set(Collection::TextNotes, "n1", &fields);

        let mut bridge = synced_bridge("p1");
        bridge.apply_remote(&remote.full_state()).unwrap();
        assert!(bridge.text_notes().get("n1").is_none());

        let delta = bridge.update_text_note_position("n1", 999.0, 5.0).unwrap();
        assert!(bridge.text_notes().get("n1").is_none());

        remote.apply_update(&delta).unwrap();
        remote.set(Collection::TextNotes, "n1", &[("fontSize", "large".into())]);
        let repaired = remote.get::<TextNoteEntry>("n1").unwrap().unwrap();
        assert_eq!((repaired.x, repaired.y), (999.0, 5.0));
    }

    #[test]
    fn test_two_bridges_converge() {
        let mut a = synced_bridge("p1");
        let mut b = synced_bridge("p2");

        let mut to_b = vec![a.add_peer("p1", &PeerEntry::new("Alice", 2000.0, 2000.0)).unwrap()];
        let mut to_a = vec![b.add_peer("p2", &PeerEntry::new("Bob", 1900.0, 1900.0)).unwrap()];
        to_b.push(a.update_peer_position("p1", 500.0, 500.0).unwrap());
        to_a.push(b.add_text_note("n1", &TextNoteEntry::new(10.0, 10.0)).unwrap());
        to_a.push(b.insert_note_text("n1", 0, "agenda").unwrap());

        for d in &to_a {
            a.apply_remote(d).unwrap();
        }
        for d in to_b.iter().rev() {
            b.apply_remote(d).unwrap();
        }

        assert_eq!(b.peers()["p1"].x, 500.0);
        assert_eq!(b.peers()["p1"].y, 500.0);
        assert_eq!(a.text_notes(), b.text_notes());
        assert_eq!(a.note_text("n1"), "agenda");
        assert_eq!(
            a.document().entries::<PeerEntry>(),
            b.document().entries::<PeerEntry>()
        );
    }
}
