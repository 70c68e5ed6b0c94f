//! # Wedding Site Document
//!
//! The document is a JSON object of named sections. Record sections
//! (`couple`, `story`, `contact`, `moreInfo`, `eventDetails`) are flat maps of
//! scalar fields. The two sequence sections (`schedule`, `gallery`) are
//! ordered arrays of records, each carrying a stable, unique `id`.
//!
//! ```text
//! {
//!   "couple":   { "partnerOne": "...", "partnerTwo": "..." },
//!   "schedule": [ { "id": "...", "time": "4:30 PM", "event": "Arrival" } ],
//!   "gallery":  [ { "id": "...", "url": "...", "caption": "..." } ],
//!   "activeTemplateId": "model_1"
//! }
//! ```
//!
//! Unknown top-level keys are carried through untouched.

use crate::{CommonError, CommonResult, IdGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Top-level key holding the active template identifier
pub const ACTIVE_TEMPLATE_ID: &str = "activeTemplateId";

/// Template assigned to freshly created documents
pub const DEFAULT_TEMPLATE_ID: &str = "model_1";

/// Sections whose value is a flat record of scalar fields
pub const RECORD_SECTIONS: [&str; 5] = ["couple", "story", "contact", "moreInfo", "eventDetails"];

/// Key of the element identifier inside sequence records
pub const ITEM_ID: &str = "id";

/// Location of the public site slug
pub const SLUG_SECTION: &str = "moreInfo";
pub const SLUG_FIELD: &str = "slug";

/// The two ordered sequence sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Schedule,
    Gallery,
}

impl SequenceKind {
    pub const ALL: [SequenceKind; 2] = [SequenceKind::Schedule, SequenceKind::Gallery];

    pub fn from_section(section: &str) -> Option<Self> {
        match section {
            "schedule" => Some(SequenceKind::Schedule),
            "gallery" => Some(SequenceKind::Gallery),
            _ => None,
        }
    }

    pub fn section(self) -> &'static str {
        match self {
            SequenceKind::Schedule => "schedule",
            SequenceKind::Gallery => "gallery",
        }
    }

    /// Empty record used when a sequence has to grow to reach an index
    pub fn empty_item(self, id: String) -> Value {
        match self {
            SequenceKind::Schedule => json!({
                "id": id,
                "time": "",
                "event": "",
                "description": "",
            }),
            SequenceKind::Gallery => json!({
                "id": id,
                "url": "",
                "caption": "",
            }),
        }
    }
}

/// Identifier of a sequence element, if it has a usable one
pub fn item_id(item: &Value) -> Option<&str> {
    item.get(ITEM_ID)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Committed (or merged) wedding site document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap a JSON value; the root must be an object
    pub fn from_value(value: Value) -> CommonResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CommonError::InvalidDocument(format!(
                "expected an object at the root, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Document created for an owner that has none yet
    pub fn default_for(template_id: &str, ids: &IdGenerator) -> Self {
        let value = json!({
            "couple": {
                "partnerOne": "",
                "partnerTwo": "",
                "tagline": "",
            },
            "story": {
                "title": "Our Story",
                "content": "",
            },
            "contact": {
                "email": "",
                "phone": "",
            },
            "moreInfo": {
                "slug": "",
                "dressCode": "",
                "notes": "",
            },
            "eventDetails": {
                "date": "",
                "venue": "",
                "address": "",
            },
            "schedule": [
                {
                    "id": ids.new_id(),
                    "time": "4:30 PM",
                    "event": "Arrival",
                    "description": "",
                }
            ],
            "gallery": [],
            "activeTemplateId": template_id,
        });

        match value {
            Value::Object(map) => Self(map),
            _ => Self::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Record section by name
    pub fn section(&self, name: &str) -> Option<&Map<String, Value>> {
        self.0.get(name).and_then(Value::as_object)
    }

    pub fn field(&self, section: &str, field: &str) -> Option<&Value> {
        self.section(section).and_then(|s| s.get(field))
    }

    /// Sequence section by name; empty when missing or malformed
    pub fn sequence(&self, name: &str) -> &[Value] {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn item_field(&self, section: &str, index: usize, field: &str) -> Option<&Value> {
        self.sequence(section).get(index).and_then(|item| item.get(field))
    }

    /// Public slug, if one has been chosen
    pub fn slug(&self) -> Option<&str> {
        self.field(SLUG_SECTION, SLUG_FIELD)
            .and_then(Value::as_str)
            .filter(|slug| !slug.is_empty())
    }

    pub fn active_template_id(&self) -> Option<&str> {
        self.0.get(ACTIVE_TEMPLATE_ID).and_then(Value::as_str)
    }

    /// Shallow merge: every top-level key in the patch replaces ours
    pub fn apply_patch(&mut self, patch: &DocumentPatch) {
        for (key, value) in patch.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Partial document used for shallow commits
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentPatch(Map<String, Value>);

impl DocumentPatch {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for DocumentPatch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Structural normalization applied on load and on every remote push.
///
/// Sequences become well-formed arrays of records with unique, non-empty
/// ids. Existing elements keep their position and content; nothing is
/// rebuilt from other fields and nothing is appended.
pub fn normalize(value: Value, ids: &IdGenerator) -> CommonResult<Document> {
    let mut doc = Document::from_value(value)?;

    for kind in SequenceKind::ALL {
        let items = match doc.0.remove(kind.section()) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        doc.0
            .insert(kind.section().to_string(), Value::Array(normalize_items(items, ids)));
    }

    Ok(doc)
}

fn normalize_items(items: Vec<Value>, ids: &IdGenerator) -> Vec<Value> {
    let existing: Vec<String> = items
        .iter()
        .filter_map(|item| stringify_id(item.get(ITEM_ID)?))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(items.len());

    for item in items {
        let Value::Object(mut record) = item else {
            continue;
        };

        let id = record.get(ITEM_ID).and_then(stringify_id);
        let id = match id {
            Some(id) if !seen.contains(&id) => id,
            _ => ids.new_id_avoiding(existing.iter().map(String::as_str)),
        };

        seen.insert(id.clone());
        record.insert(ITEM_ID.to_string(), Value::String(id));
        out.push(Value::Object(record));
    }

    out
}

fn stringify_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdGenerator {
        IdGenerator::from_seed("t")
    }

    #[test]
    fn test_default_document_shape() {
        let doc = Document::default_for(DEFAULT_TEMPLATE_ID, &ids());

        for section in RECORD_SECTIONS {
            assert!(doc.section(section).is_some(), "missing {section}");
        }
        assert_eq!(doc.sequence("schedule").len(), 1);
        assert_eq!(doc.item_field("schedule", 0, "event"), Some(&json!("Arrival")));
        assert!(doc.sequence("gallery").is_empty());
        assert_eq!(doc.active_template_id(), Some("model_1"));
    }

    #[test]
    fn test_root_must_be_object() {
        assert!(normalize(json!([1, 2]), &ids()).is_err());
        assert!(normalize(json!(null), &ids()).is_err());
    }

    #[test]
    fn test_normalize_fills_missing_sequences() {
        let doc = normalize(json!({ "couple": { "partnerOne": "A" } }), &ids()).unwrap();

        assert_eq!(doc.get("schedule"), Some(&json!([])));
        assert_eq!(doc.get("gallery"), Some(&json!([])));
        assert_eq!(doc.field("couple", "partnerOne"), Some(&json!("A")));
        assert!(doc.section("story").is_none());
    }

    #[test]
    fn test_normalize_repairs_ids_without_reordering() {
        let doc = normalize(
            json!({
                "schedule": [
                    { "id": "1", "time": "4:30 PM" },
                    "garbage",
                    { "time": "5:00 PM" },
                    { "id": "1", "time": "6:00 PM" },
                    { "id": 7, "time": "7:00 PM" }
                ],
                "gallery": "not an array"
            }),
            &ids(),
        )
        .unwrap();

        let schedule = doc.sequence("schedule");
        assert_eq!(schedule.len(), 4);
        assert_eq!(item_id(&schedule[0]), Some("1"));
        assert_eq!(schedule[1]["time"], json!("5:00 PM"));
        assert_eq!(item_id(&schedule[1]), Some("t-1"));
        assert_eq!(item_id(&schedule[2]), Some("t-2"));
        assert_eq!(schedule[2]["time"], json!("6:00 PM"));
        assert_eq!(item_id(&schedule[3]), Some("7"));
        assert!(doc.sequence("gallery").is_empty());
    }

    #[test]
    fn test_shallow_patch_replaces_whole_sections() {
        let mut doc = Document::from_value(json!({
            "couple": { "partnerOne": "A", "partnerTwo": "B" },
            "story": { "title": "T" }
        }))
        .unwrap();

        doc.apply_patch(&DocumentPatch::new().with("couple", json!({ "partnerOne": "C" })));

        assert_eq!(doc.field("couple", "partnerOne"), Some(&json!("C")));
        assert_eq!(doc.field("couple", "partnerTwo"), None);
        assert_eq!(doc.field("story", "title"), Some(&json!("T")));
    }

    #[test]
    fn test_sequence_kind_padding_records() {
        let schedule = SequenceKind::Schedule.empty_item("x".into());
        assert_eq!(schedule, json!({ "id": "x", "time": "", "event": "", "description": "" }));

        let gallery = SequenceKind::Gallery.empty_item("y".into());
        assert_eq!(gallery, json!({ "id": "y", "url": "", "caption": "" }));

        assert_eq!(SequenceKind::from_section("couple"), None);
    }
}
