//! # Pending Change Tracker
//!
//! Sparse overlay of edits the owner has not committed yet. Keys are
//! `(section, field)` for record sections, `(section, index, field)` for
//! sequence elements, a whole-sequence override for add/remove, or a bare
//! top-level key such as `activeTemplateId`.
//!
//! ## Merge semantics
//!
//! - record fields overwrite the committed field (missing sections are created)
//! - a whole-sequence override replaces the committed array
//! - element edits are overlaid by index; slots past the committed end are
//!   padded with the section's empty record
//! - top-level values replace the committed key
//!
//! Merging never deletes a committed field. A key is only held while its
//! value differs from the committed one.

use crate::errors::{SyncError, SyncResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use vows_common::{
    item_id, Document, DocumentPatch, IdGenerator, SequenceKind, ITEM_ID, RECORD_SECTIONS,
};

/// Pending edits for one element of a sequence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingItem {
    /// Empty record to append when the element is past the committed end
    scaffold: Option<Value>,
    fields: Map<String, Value>,
}

impl PendingItem {
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn is_scaffold(&self) -> bool {
        self.scaffold.is_some()
    }

    fn is_empty(&self) -> bool {
        self.scaffold.is_none() && self.fields.is_empty()
    }
}

/// Pending state of one top-level key
#[derive(Debug, Clone, PartialEq)]
pub enum PendingSection {
    /// Field edits on a record section
    Fields(Map<String, Value>),
    /// Element edits on a sequence, keyed by index
    Items(BTreeMap<usize, PendingItem>),
    /// Whole-sequence override
    Replaced(Vec<Value>),
    /// Top-level value such as the template id
    Value(Value),
}

impl PendingSection {
    fn is_empty(&self) -> bool {
        match self {
            PendingSection::Fields(fields) => fields.is_empty(),
            PendingSection::Items(items) => items.is_empty(),
            PendingSection::Replaced(_) | PendingSection::Value(_) => false,
        }
    }
}

/// The pending change set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    sections: BTreeMap<String, PendingSection>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &PendingSection)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn section(&self, section: &str) -> Option<&PendingSection> {
        self.sections.get(section)
    }

    pub fn field(&self, section: &str, field: &str) -> Option<&Value> {
        match self.sections.get(section)? {
            PendingSection::Fields(fields) => fields.get(field),
            _ => None,
        }
    }

    pub fn item_field(&self, section: &str, index: usize, field: &str) -> Option<&Value> {
        match self.sections.get(section)? {
            PendingSection::Items(items) => items.get(&index)?.fields.get(field),
            PendingSection::Replaced(items) => items.get(index)?.get(field),
            _ => None,
        }
    }

    /// Record a field edit on a record section.
    ///
    /// Returns whether the pending set changed.
    pub fn set_pending(
        &mut self,
        committed: &Document,
        section: &str,
        field: &str,
        value: Value,
    ) -> SyncResult<bool> {
        let holds_scalar = committed
            .get(section)
            .map(|v| !v.is_object() && !v.is_null())
            .unwrap_or(false);
        if holds_scalar || SequenceKind::from_section(section).is_some() {
            return Err(SyncError::NotARecord(section.to_string()));
        }

        let matches_committed = committed.field(section, field) == Some(&value);

        if !matches!(self.sections.get(section), Some(PendingSection::Fields(_))) {
            if matches_committed {
                return Ok(false);
            }
            self.sections
                .insert(section.to_string(), PendingSection::Fields(Map::new()));
        }
        let Some(PendingSection::Fields(fields)) = self.sections.get_mut(section) else {
            return Ok(false);
        };

        let changed = if matches_committed {
            fields.remove(field).is_some()
        } else if fields.get(field) == Some(&value) {
            false
        } else {
            fields.insert(field.to_string(), value);
            true
        };

        self.drop_if_empty(section);
        Ok(changed)
    }

    /// Record a field edit on element `index` of a sequence, growing the
    /// sequence with empty records when the index is past its end.
    pub fn set_pending_item(
        &mut self,
        committed: &Document,
        ids: &IdGenerator,
        section: &str,
        index: usize,
        field: &str,
        value: Value,
    ) -> SyncResult<bool> {
        let kind = SequenceKind::from_section(section)
            .ok_or_else(|| SyncError::NotASequence(section.to_string()))?;
        if field == ITEM_ID {
            return Err(SyncError::ImmutableId);
        }

        let committed_items = committed.sequence(section);

        if let Some(PendingSection::Replaced(items)) = self.sections.get_mut(section) {
            while items.len() <= index {
                let id = fresh_id(ids, committed_items, items);
                items.push(kind.empty_item(id));
            }
            if !items[index].is_object() {
                let id = fresh_id(ids, committed_items, items);
                items[index] = kind.empty_item(id);
            }
            return Ok(match &mut items[index] {
                Value::Object(record) if record.get(field) != Some(&value) => {
                    record.insert(field.to_string(), value);
                    true
                }
                _ => false,
            });
        }

        let len = committed_items.len();
        let matches_committed =
            index < len && committed_items[index].get(field) == Some(&value);

        if !matches!(self.sections.get(section), Some(PendingSection::Items(_))) {
            if matches_committed {
                return Ok(false);
            }
            self.sections
                .insert(section.to_string(), PendingSection::Items(BTreeMap::new()));
        }
        let Some(PendingSection::Items(items)) = self.sections.get_mut(section) else {
            return Ok(false);
        };

        let mut changed = false;
        for slot in len..=index {
            if !items.contains_key(&slot) {
                let scaffold_ids: Vec<&str> = items
                    .values()
                    .filter_map(|item| item.scaffold.as_ref().and_then(item_id))
                    .collect();
                let id = ids.new_id_avoiding(
                    committed_items
                        .iter()
                        .filter_map(item_id)
                        .chain(scaffold_ids.iter().copied())
                        .collect::<Vec<_>>()
                        .into_iter(),
                );
                items.insert(
                    slot,
                    PendingItem {
                        scaffold: Some(kind.empty_item(id)),
                        fields: Map::new(),
                    },
                );
                changed = true;
            }
        }

        let item = items.entry(index).or_default();
        if matches_committed {
            changed |= item.fields.remove(field).is_some();
            if item.is_empty() {
                items.remove(&index);
            }
        } else if item.fields.get(field) != Some(&value) {
            item.fields.insert(field.to_string(), value);
            changed = true;
        }

        self.drop_if_empty(section);
        Ok(changed)
    }

    /// Override a whole sequence (used for add and remove).
    ///
    /// Supersedes any element edits held for the section. Elements without
    /// a usable id, or repeating one, are given a fresh id.
    pub fn replace_sequence(
        &mut self,
        committed: &Document,
        ids: &IdGenerator,
        section: &str,
        items: Vec<Value>,
    ) -> SyncResult<bool> {
        let kind = SequenceKind::from_section(section)
            .ok_or_else(|| SyncError::NotASequence(section.to_string()))?;

        let mut seen: Vec<String> = Vec::with_capacity(items.len());
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let mut record = match item {
                Value::Object(record) => record,
                _ => match kind.empty_item(String::new()) {
                    Value::Object(record) => record,
                    _ => Map::new(),
                },
            };
            let id = match record.get(ITEM_ID).and_then(Value::as_str) {
                Some(id) if !id.is_empty() && !seen.iter().any(|s| s == id) => id.to_string(),
                _ => ids.new_id_avoiding(
                    committed
                        .sequence(section)
                        .iter()
                        .filter_map(item_id)
                        .chain(seen.iter().map(String::as_str))
                        .collect::<Vec<_>>()
                        .into_iter(),
                ),
            };
            record.insert(ITEM_ID.to_string(), Value::String(id.clone()));
            seen.push(id);
            out.push(Value::Object(record));
        }

        if committed.get(section).and_then(Value::as_array) == Some(&out) {
            return Ok(self.sections.remove(section).is_some());
        }
        let next = PendingSection::Replaced(out);
        if self.sections.get(section) == Some(&next) {
            return Ok(false);
        }
        self.sections.insert(section.to_string(), next);
        Ok(true)
    }

    /// Record a top-level value such as `activeTemplateId`.
    ///
    /// The key does not have to exist in the committed document.
    pub fn set_pending_value(
        &mut self,
        committed: &Document,
        key: &str,
        value: Value,
    ) -> SyncResult<bool> {
        if RECORD_SECTIONS.contains(&key) || SequenceKind::from_section(key).is_some() {
            return Err(SyncError::NotAValue(key.to_string()));
        }

        if committed.get(key) == Some(&value) {
            return Ok(self.sections.remove(key).is_some());
        }
        let next = PendingSection::Value(value);
        if self.sections.get(key) == Some(&next) {
            return Ok(false);
        }
        self.sections.insert(key.to_string(), next);
        Ok(true)
    }

    pub fn clear_field(&mut self, section: &str, field: &str) -> bool {
        let removed = match self.sections.get_mut(section) {
            Some(PendingSection::Fields(fields)) => fields.remove(field).is_some(),
            _ => false,
        };
        self.drop_if_empty(section);
        removed
    }

    pub fn clear_item_field(&mut self, section: &str, index: usize, field: &str) -> bool {
        let removed = match self.sections.get_mut(section) {
            Some(PendingSection::Items(items)) => {
                let removed = items
                    .get_mut(&index)
                    .map(|item| item.fields.remove(field).is_some())
                    .unwrap_or(false);
                if items.get(&index).map(PendingItem::is_empty).unwrap_or(false) {
                    items.remove(&index);
                }
                removed
            }
            _ => false,
        };
        self.drop_if_empty(section);
        removed
    }

    /// Remove every pending key under a top-level key
    pub fn clear_section(&mut self, section: &str) -> bool {
        self.sections.remove(section).is_some()
    }

    pub fn clear_all(&mut self) -> bool {
        let had_any = !self.sections.is_empty();
        self.sections.clear();
        had_any
    }

    /// Drop every pending key a committed patch covered.
    ///
    /// Record sections lose only the fields present in the patched record;
    /// any other top-level key is dropped whole.
    pub fn clear_patched(&mut self, patch: &DocumentPatch) -> bool {
        let mut changed = false;
        for (section, value) in patch.iter() {
            let whole = match (self.sections.get_mut(section.as_str()), value) {
                (Some(PendingSection::Fields(fields)), Value::Object(record)) => {
                    for field in record.keys() {
                        changed |= fields.remove(field).is_some();
                    }
                    false
                }
                (Some(_), _) => true,
                (None, _) => continue,
            };
            if whole {
                self.sections.remove(section.as_str());
                changed = true;
            }
            self.drop_if_empty(section);
        }
        changed
    }

    /// Copy of this set holding only one record field
    pub fn only_field(&self, section: &str, field: &str) -> PendingChanges {
        let mut out = PendingChanges::new();
        if let Some(value) = self.field(section, field) {
            let mut fields = Map::new();
            fields.insert(field.to_string(), value.clone());
            out.sections
                .insert(section.to_string(), PendingSection::Fields(fields));
        }
        out
    }

    /// Copy of this set holding only one top-level key
    pub fn only_section(&self, section: &str) -> PendingChanges {
        let mut out = PendingChanges::new();
        if let Some(pending) = self.sections.get(section) {
            out.sections.insert(section.to_string(), pending.clone());
        }
        out
    }

    /// Remove the keys of `committed` whose value is still what was committed.
    ///
    /// Used after a successful commit: edits made while the commit was in
    /// flight are different values and survive.
    pub fn subtract(&mut self, committed: &PendingChanges) {
        for (section, done) in &committed.sections {
            let Some(current) = self.sections.get_mut(section) else {
                continue;
            };
            match (current, done) {
                (PendingSection::Fields(current), PendingSection::Fields(done)) => {
                    for (field, value) in done {
                        if current.get(field) == Some(value) {
                            current.remove(field);
                        }
                    }
                }
                (PendingSection::Items(current), PendingSection::Items(done)) => {
                    for (index, done_item) in done {
                        let Some(item) = current.get_mut(index) else {
                            continue;
                        };
                        for (field, value) in &done_item.fields {
                            if item.fields.get(field) == Some(value) {
                                item.fields.remove(field);
                            }
                        }
                        if item.scaffold == done_item.scaffold {
                            item.scaffold = None;
                        }
                        if item.is_empty() {
                            current.remove(index);
                        }
                    }
                }
                (current, done) => {
                    if current == done {
                        *current = PendingSection::Fields(Map::new());
                    }
                }
            }
            self.drop_if_empty(section);
        }
    }

    /// Committed document with every pending key applied
    pub fn merge(&self, document: &Document) -> Document {
        let mut out = document.clone();

        for (section, pending) in &self.sections {
            match pending {
                PendingSection::Fields(fields) => {
                    let map = out.as_map_mut();
                    let target = map
                        .entry(section.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !target.is_object() {
                        *target = Value::Object(Map::new());
                    }
                    if let Value::Object(record) = target {
                        for (field, value) in fields {
                            record.insert(field.clone(), value.clone());
                        }
                    }
                }
                PendingSection::Items(items) => {
                    let mut merged = document.sequence(section).to_vec();
                    for (index, item) in items {
                        // scaffolds follow their id; the sequence may have grown since
                        let target = match &item.scaffold {
                            Some(scaffold) => {
                                let id = item_id(scaffold);
                                let existing = merged
                                    .iter()
                                    .position(|e| id.is_some() && item_id(e) == id);
                                match existing {
                                    Some(at) => Some(at),
                                    None => {
                                        merged.push(scaffold.clone());
                                        Some(merged.len() - 1)
                                    }
                                }
                            }
                            None => (*index < merged.len()).then_some(*index),
                        };
                        let record = target.and_then(|at| merged.get_mut(at));
                        if let Some(Value::Object(record)) = record {
                            for (field, value) in &item.fields {
                                record.insert(field.clone(), value.clone());
                            }
                        }
                    }
                    out.set(section.clone(), Value::Array(merged));
                }
                PendingSection::Replaced(items) => {
                    out.set(section.clone(), Value::Array(items.clone()));
                }
                PendingSection::Value(value) => {
                    out.set(section.clone(), value.clone());
                }
            }
        }

        out
    }

    /// Shallow patch committing one record field
    pub fn patch_for_field(
        &self,
        committed: &Document,
        section: &str,
        field: &str,
    ) -> Option<DocumentPatch> {
        let value = self.field(section, field)?;
        let mut record = committed.section(section).cloned().unwrap_or_default();
        record.insert(field.to_string(), value.clone());
        Some(DocumentPatch::new().with(section, Value::Object(record)))
    }

    /// Shallow patch committing everything pending under one top-level key
    pub fn patch_for_section(&self, committed: &Document, section: &str) -> Option<DocumentPatch> {
        self.sections.get(section)?;
        let merged = self.only_section(section).merge(committed);
        let value = merged.get(section)?.clone();
        Some(DocumentPatch::new().with(section, value))
    }

    /// Shallow patch committing the whole pending set
    pub fn patch_all(&self, committed: &Document) -> DocumentPatch {
        let merged = self.merge(committed);
        let mut patch = DocumentPatch::new();
        for section in self.sections.keys() {
            if let Some(value) = merged.get(section) {
                patch.insert(section.clone(), value.clone());
            }
        }
        patch
    }

    fn drop_if_empty(&mut self, section: &str) {
        if self.sections.get(section).map(PendingSection::is_empty).unwrap_or(false) {
            self.sections.remove(section);
        }
    }
}

fn fresh_id(ids: &IdGenerator, committed: &[Value], pending: &[Value]) -> String {
    let taken: Vec<&str> = committed
        .iter()
        .chain(pending.iter())
        .filter_map(item_id)
        .collect();
    ids.new_id_avoiding(taken.iter().copied())
}

/// Shared handle to the pending change set.
///
/// Every mutation that changes the set bumps a revision so the preview
/// channel can push a fresh snapshot.
#[derive(Clone)]
pub struct PendingTracker {
    changes: Arc<Mutex<PendingChanges>>,
    ids: Arc<IdGenerator>,
    revision: Arc<watch::Sender<u64>>,
}

impl PendingTracker {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            changes: Arc::new(Mutex::new(PendingChanges::new())),
            ids,
            revision: Arc::new(revision),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingChanges> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_if(&self, changed: bool) -> bool {
        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        changed
    }

    pub fn set_pending(
        &self,
        committed: &Document,
        section: &str,
        field: &str,
        value: Value,
    ) -> SyncResult<bool> {
        let changed = self.lock().set_pending(committed, section, field, value)?;
        Ok(self.bump_if(changed))
    }

    pub fn set_pending_item(
        &self,
        committed: &Document,
        section: &str,
        index: usize,
        field: &str,
        value: Value,
    ) -> SyncResult<bool> {
        let changed =
            self.lock()
                .set_pending_item(committed, &self.ids, section, index, field, value)?;
        Ok(self.bump_if(changed))
    }

    pub fn replace_sequence(
        &self,
        committed: &Document,
        section: &str,
        items: Vec<Value>,
    ) -> SyncResult<bool> {
        let changed = self
            .lock()
            .replace_sequence(committed, &self.ids, section, items)?;
        Ok(self.bump_if(changed))
    }

    pub fn set_pending_value(
        &self,
        committed: &Document,
        key: &str,
        value: Value,
    ) -> SyncResult<bool> {
        let changed = self.lock().set_pending_value(committed, key, value)?;
        Ok(self.bump_if(changed))
    }

    pub fn clear_field(&self, section: &str, field: &str) -> bool {
        let changed = self.lock().clear_field(section, field);
        self.bump_if(changed)
    }

    pub fn clear_item_field(&self, section: &str, index: usize, field: &str) -> bool {
        let changed = self.lock().clear_item_field(section, index, field);
        self.bump_if(changed)
    }

    pub fn clear_section(&self, section: &str) -> bool {
        let changed = self.lock().clear_section(section);
        self.bump_if(changed)
    }

    pub fn clear_all(&self) -> bool {
        let changed = self.lock().clear_all();
        self.bump_if(changed)
    }

    pub fn subtract(&self, committed: &PendingChanges) {
        let changed = {
            let mut changes = self.lock();
            let before = changes.clone();
            changes.subtract(committed);
            *changes != before
        };
        self.bump_if(changed);
    }

    pub fn clear_patched(&self, patch: &DocumentPatch) -> bool {
        let changed = self.lock().clear_patched(patch);
        self.bump_if(changed)
    }

    pub fn merge(&self, document: &Document) -> Document {
        self.lock().merge(document)
    }

    /// Copy of the current pending set
    pub fn snapshot(&self) -> PendingChanges {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
