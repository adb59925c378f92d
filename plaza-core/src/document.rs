//! Replicated space document.
//!
//! Layout inside the yrs `Doc`:
//! ```text
//! peers         : Map<peerId,  Map<field, scalar>>
//! screenShares  : Map<shareId, Map<field, scalar>>
//! textNotes     : Map<noteId,  Map<field, scalar>>
//! note:<noteId> : Text            (one per note body)
//! ```
//!
//! Each entity is a nested map, so every field is its own last-writer-wins
//! register. Two clients writing different fields of the same entity both
//! keep their write. Entities written by clients that store a whole value
//! object at the key are still readable and get upgraded to a nested map on
//! the next local write.
//!
//! Every mutation runs in one transaction and returns the encoded update
//! for that transaction, ready to broadcast.

use std::collections::BTreeMap;
use std::sync::Arc;

use yrs::types::{Map, MapRef};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, MapPrelim, Out, ReadTxn, StateVector, Text, Transact, TransactionMut,
    Update, WriteTxn,
};

use crate::{Collection, Delta, Entity, FieldMap, FieldValue};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to decode CRDT payload: {0}")]
    Decode(String),

    #[error("Failed to apply CRDT update: {0}")]
    Apply(String),

    #[error("Entity is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for field '{0}': {1}")]
    InvalidField(&'static str, String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// Name of the root text holding a note body.
pub fn note_text_name(note_id: &str) -> String {
    format!("note:{note_id}")
}

fn any_from_field(value: &FieldValue) -> Any {
    match value {
        FieldValue::Number(n) => Any::Number(*n),
        FieldValue::Bool(b) => Any::Bool(*b),
        FieldValue::Text(s) => Any::String(s.as_str().into()),
    }
}

fn field_from_any(value: &Any) -> Option<FieldValue> {
    match value {
        Any::Number(n) => Some(FieldValue::Number(*n)),
        Any::BigInt(i) => Some(FieldValue::Number(*i as f64)),
        Any::Bool(b) => Some(FieldValue::Bool(*b)),
        Any::String(s) => Some(FieldValue::Text(s.to_string())),
        _ => None,
    }
}

/// The shared document of one space.
pub struct SpaceDocument {
    doc: Doc,
    peers: MapRef,
    screen_shares: MapRef,
    text_notes: MapRef,
}

impl Default for SpaceDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let peers = doc.get_or_insert_map(Collection::Peers.map_name());
        let screen_shares = doc.get_or_insert_map(Collection::ScreenShares.map_name());
        let text_notes = doc.get_or_insert_map(Collection::TextNotes.map_name());
        Self {
            doc,
            peers,
            screen_shares,
            text_notes,
        }
    }

    fn map(&self, collection: Collection) -> &MapRef {
        match collection {
            Collection::Peers => &self.peers,
            Collection::ScreenShares => &self.screen_shares,
            Collection::TextNotes => &self.text_notes,
        }
    }

    // ---------------------------------------------------------------
    // Entity maps
    // ---------------------------------------------------------------

    /// Merge `fields` into the entity at `id`, creating it if absent.
    pub fn set(&self, collection: Collection, id: &str, fields: &[(&str, FieldValue)]) -> Delta {
        let map = self.map(collection);
        let mut txn = self.doc.transact_mut();

        match map.get(&txn, id) {
            Some(Out::YMap(entity)) => {
                for (key, value) in fields {
                    entity.insert(&mut txn, *key, any_from_field(value));
                }
            }
            Some(Out::Any(Any::Map(legacy))) => {
                // Whole-value entry: fold it into a nested map first.
                let mut merged: BTreeMap<String, Any> = legacy
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                for (key, value) in fields {
                    merged.insert(key.to_string(), any_from_field(value));
                }
                let prelim: MapPrelim = merged.into_iter().collect();
                map.insert(&mut txn, id, prelim);
            }
            _ => {
                let prelim: MapPrelim = fields
                    .iter()
                    .map(|(key, value)| (key.to_string(), any_from_field(value)))
                    .collect();
                map.insert(&mut txn, id, prelim);
            }
        }

        txn.encode_update_v1()
    }

    /// Remove the entity at `id`. Returns `None` when it was not present.
    pub fn delete(&self, collection: Collection, id: &str) -> Option<Delta> {
        let map = self.map(collection);
        let mut txn = self.doc.transact_mut();
        map.remove(&mut txn, id)?;
        Some(txn.encode_update_v1())
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        let txn = self.doc.transact();
        self.map(collection).contains_key(&txn, id)
    }

    /// Raw fields of one entity.
    pub fn fields<T: ReadTxn>(&self, txn: &T, collection: Collection, id: &str) -> Option<FieldMap> {
        let value = self.map(collection).get(txn, id)?;
        Some(Self::decode_fields(txn, &value))
    }

    fn decode_fields<T: ReadTxn>(txn: &T, value: &Out) -> FieldMap {
        let mut fields = FieldMap::new();
        match value {
            Out::YMap(entity) => {
                for (key, out) in entity.iter(txn) {
                    if let Out::Any(any) = out {
                        if let Some(field) = field_from_any(&any) {
                            fields.insert(key.to_string(), field);
                        }
                    }
                }
            }
            Out::Any(Any::Map(legacy)) => {
                for (key, any) in legacy.iter() {
                    if let Some(field) = field_from_any(any) {
                        fields.insert(key.clone(), field);
                    }
                }
            }
            _ => {}
        }
        fields
    }

    /// Typed read of one entity.
    pub fn get<E: Entity>(&self, id: &str) -> Result<Option<E>, DocumentError> {
        let txn = self.doc.transact();
        match self.fields(&txn, E::COLLECTION, id) {
            Some(fields) => E::from_fields(&fields).map(Some),
            None => Ok(None),
        }
    }

    /// Typed read of a whole collection. Malformed entries are skipped.
    pub fn entries<E: Entity>(&self) -> BTreeMap<String, E> {
        let txn = self.doc.transact();
        let mut out = BTreeMap::new();
        for (id, value) in self.map(E::COLLECTION).iter(&txn) {
            let fields = Self::decode_fields(&txn, &value);
            match E::from_fields(&fields) {
                Ok(entity) => {
                    out.insert(id.to_string(), entity);
                }
                Err(e) => {
                    log::warn!(
                        "Skipping malformed {} entry {id}: {e}",
                        E::COLLECTION.map_name()
                    );
                }
            }
        }
        out
    }

    /// Number of entries in a collection.
    pub fn len(&self, collection: Collection) -> u32 {
        let txn = self.doc.transact();
        self.map(collection).len(&txn)
    }

    pub fn ids(&self, collection: Collection) -> Vec<String> {
        let txn = self.doc.transact();
        self.map(collection).keys(&txn).map(|k| k.to_string()).collect()
    }

    // ---------------------------------------------------------------
    // Note bodies
    // ---------------------------------------------------------------

    // Positions in the public API count characters; yrs counts UTF-8 bytes.

    fn edit_text<F>(&self, note_id: &str, edit: F) -> Delta
    where
        F: FnOnce(&mut TransactionMut, &yrs::TextRef),
    {
        let name: Arc<str> = note_text_name(note_id).into();
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(name);
        edit(&mut txn, &text);
        txn.encode_update_v1()
    }

    /// Insert `chunk` into a note body at character `index`, clamped to
    /// the end of the body.
    pub fn insert_text(&self, note_id: &str, index: u32, chunk: &str) -> Delta {
        self.edit_text(note_id, |txn, text| {
            let body = text.get_string(&*txn);
            text.insert(txn, byte_offset(&body, index), chunk);
        })
    }

    /// Remove up to `len` characters starting at character `index`.
    pub fn delete_text(&self, note_id: &str, index: u32, len: u32) -> Delta {
        self.edit_text(note_id, |txn, text| {
            let body = text.get_string(&*txn);
            let start = byte_offset(&body, index);
            let end = byte_offset(&body, index.saturating_add(len));
            if start < end {
                text.remove_range(txn, start, end - start);
            }
        })
    }

    /// Empty a note body. Root texts cannot be dropped from the document.
    pub fn clear_text(&self, note_id: &str) -> Option<Delta> {
        if self.note_text(note_id).is_empty() {
            return None;
        }
        Some(self.edit_text(note_id, |txn, text| {
            let total = text.len(&*txn);
            text.remove_range(txn, 0, total);
        }))
    }

    /// Current body of a note (empty if never written).
    pub fn note_text(&self, note_id: &str) -> String {
        let name: Arc<str> = note_text_name(note_id).into();
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------

    /// Encoded state vector for a sync step 1.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_sv` is missing.
    pub fn diff(&self, remote_sv: &[u8]) -> Result<Delta, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Complete document state as a single update.
    pub fn full_state(&self) -> Delta {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Integrate a remote update. Safe to call with duplicates or
    /// out-of-order updates; yrs buffers missing dependencies.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }
}

/// Byte offset of the `chars`-th character of `body`, clamped to its length.
fn byte_offset(body: &str, chars: u32) -> u32 {
    let offset = body
        .char_indices()
        .nth(chars as usize)
        .map_or(body.len(), |(i, _)| i);
    offset as u32
}
