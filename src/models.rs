//! Core data models flowing through the sync and index pipeline.
//!
//! Remote entities are cached raw (key, version, JSON payload) and only
//! parsed into the typed layer at the transformer boundary. Parsing is a
//! tagged dispatch over known item types with an explicit extension bucket,
//! so unexpected remote vocabulary degrades gracefully instead of failing
//! the whole build.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Entity collections tracked separately in the cache and in sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Collection,
    Item,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Collection => "collection",
            EntityKind::Item => "item",
        }
    }
}

/// A raw remote entity as cached: stable key, remote revision counter, and
/// the unparsed field map. Never mutated locally.
#[derive(Debug, Clone)]
pub struct RemoteEntity {
    pub key: String,
    pub version: i64,
    pub parent_key: Option<String>,
    pub data: Value,
}

/// Per-collection sync position, persisted in the cache database. The
/// version only advances after the batch that produced it has durably
/// committed.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub version: i64,
    pub fully_synced: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// Typed entity layer
// ═══════════════════════════════════════════════════════════════════════

/// Known bibliographic item types, with an extension bucket for vocabulary
/// this build does not model explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemType {
    JournalArticle,
    Book,
    BookSection,
    ConferencePaper,
    Thesis,
    Report,
    Webpage,
    Other(String),
}

impl ItemType {
    pub fn from_remote(s: &str) -> Self {
        match s {
            "journalArticle" => ItemType::JournalArticle,
            "book" => ItemType::Book,
            "bookSection" => ItemType::BookSection,
            "conferencePaper" => ItemType::ConferencePaper,
            "thesis" => ItemType::Thesis,
            "report" => ItemType::Report,
            "webpage" => ItemType::Webpage,
            other => ItemType::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ItemType::JournalArticle => "journalArticle",
            ItemType::Book => "book",
            ItemType::BookSection => "bookSection",
            ItemType::ConferencePaper => "conferencePaper",
            ItemType::Thesis => "thesis",
            ItemType::Report => "report",
            ItemType::Webpage => "webpage",
            ItemType::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Creator {
    #[serde(default, rename = "creatorType")]
    pub creator_type: String,
    #[serde(default, rename = "firstName")]
    pub first_name: String,
    #[serde(default, rename = "lastName")]
    pub last_name: String,
    /// Single-field name form used by some remote records.
    #[serde(default)]
    pub name: String,
}

impl Creator {
    /// Display name: "First Last", or the single-field form when present.
    pub fn display(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (true, false) => self.last_name.clone(),
            (false, true) => self.first_name.clone(),
            (true, true) => String::new(),
        }
    }
}

/// Fields common to all bibliographic item types. Anything the schema does
/// not name lands in `extra` untouched.
#[derive(Debug, Clone)]
pub struct BibFields {
    pub item_type: ItemType,
    pub title: String,
    pub creators: Vec<Creator>,
    pub date: String,
    pub doi: String,
    pub isbn: String,
    pub issn: String,
    pub abstract_note: String,
    pub url: String,
    pub tags: Vec<String>,
    pub collections: Vec<String>,
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct NoteFields {
    pub note_html: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AttachmentFields {
    pub filename: String,
    pub md5: String,
    pub mtime: i64,
    pub content_type: String,
    /// Extracted text layer, when the remote supplies one.
    pub fulltext: String,
    pub tags: Vec<String>,
}

/// The typed view of a cached entity's data payload.
#[derive(Debug, Clone)]
pub enum TypedItem {
    Bib(BibFields),
    Note(NoteFields),
    Attachment(AttachmentFields),
}

impl TypedItem {
    /// Parse a raw cached payload. Missing `itemType` is a malformed entity;
    /// an unknown `itemType` is accepted into the extension bucket.
    pub fn parse(key: &str, data: &Value) -> Result<TypedItem, SyncError> {
        let obj = data.as_object().ok_or_else(|| SyncError::MalformedEntity {
            key: key.to_string(),
            message: "data is not an object".into(),
        })?;

        let item_type = obj
            .get("itemType")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::MalformedEntity {
                key: key.to_string(),
                message: "missing itemType".into(),
            })?;

        let tags = parse_tags(obj.get("tags"));

        match item_type {
            "note" => Ok(TypedItem::Note(NoteFields {
                note_html: str_field(obj, "note"),
                tags,
            })),
            "attachment" => Ok(TypedItem::Attachment(AttachmentFields {
                filename: str_field(obj, "filename"),
                md5: str_field(obj, "md5"),
                mtime: obj.get("mtime").and_then(Value::as_i64).unwrap_or(0),
                content_type: str_field(obj, "contentType"),
                fulltext: str_field(obj, "fulltext"),
                tags,
            })),
            other => {
                let known = [
                    "itemType",
                    "title",
                    "creators",
                    "date",
                    "DOI",
                    "ISBN",
                    "ISSN",
                    "abstractNote",
                    "url",
                    "tags",
                    "collections",
                ];
                let extra: serde_json::Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| !known.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                let creators = obj
                    .get("creators")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|c| serde_json::from_value(c.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();

                let collections = obj
                    .get("collections")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                Ok(TypedItem::Bib(BibFields {
                    item_type: ItemType::from_remote(other),
                    title: str_field(obj, "title"),
                    creators,
                    date: str_field(obj, "date"),
                    doi: str_field(obj, "DOI"),
                    isbn: str_field(obj, "ISBN"),
                    issn: str_field(obj, "ISSN"),
                    abstract_note: str_field(obj, "abstractNote"),
                    url: str_field(obj, "url"),
                    tags,
                    collections,
                    extra,
                }))
            }
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            TypedItem::Bib(f) => &f.tags,
            TypedItem::Note(f) => &f.tags,
            TypedItem::Attachment(f) => &f.tags,
        }
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, name: &str) -> String {
    obj.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_tags(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    // Both `{"tag": "x"}` objects and bare strings appear in
                    // the wild.
                    t.get("tag")
                        .and_then(Value::as_str)
                        .or_else(|| t.as_str())
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Collection payload: name plus optional parent for path construction.
#[derive(Debug, Clone)]
pub struct CollectionData {
    pub name: String,
    pub parent_collection: Option<String>,
}

impl CollectionData {
    pub fn parse(key: &str, data: &Value) -> Result<CollectionData, SyncError> {
        let obj = data.as_object().ok_or_else(|| SyncError::MalformedEntity {
            key: key.to_string(),
            message: "collection data is not an object".into(),
        })?;
        // The remote encodes "no parent" as boolean false, so only a string
        // value counts as a parent reference.
        let parent_collection = obj
            .get("parentCollection")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(CollectionData {
            name: str_field(obj, "name"),
            parent_collection,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Index document
// ═══════════════════════════════════════════════════════════════════════

/// One attachment descriptor inside a document's manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentEntry {
    pub key: String,
    pub filename: String,
    pub md5: String,
    pub mtime: i64,
}

/// The denormalized, query-ready representation of one bibliographic
/// record. Derived deterministically from an item and its accepted
/// children; conforms exactly to the configured schema.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexDocument {
    /// Stable id, equal to the item's remote key.
    pub id: String,
    pub item_type: String,
    pub title: String,
    pub creators: Vec<String>,
    /// Sortable normalized date (see the date extractor for the encoding).
    pub date_sort: i64,
    pub year: Option<i32>,
    pub identifiers: Vec<String>,
    /// Full abstract, always indexed and exported untruncated.
    pub abstract_text: String,
    /// Display form, truncated per the configured leeway policy.
    pub abstract_display: String,
    pub abstract_truncated: bool,
    pub fulltext: String,
    /// Display-filtered tag set.
    pub tags: Vec<String>,
    /// Untruncated tag set for raw/export paths.
    pub tags_raw: Vec<String>,
    /// Full collection paths, e.g. `"History/Middle Ages"`.
    pub collections: Vec<String>,
    pub cites: Vec<String>,
    pub cited_by: Vec<String>,
    pub badges: Vec<String>,
    pub attachments: Vec<AttachmentEntry>,
    pub url: String,
}
