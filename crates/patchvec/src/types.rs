use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::{EngineError, EngineResult};

/// Fields stored as dedicated backend columns. Filters on these names are
/// eligible for pre-filter pushdown; everything else rides in `extra` and is
/// evaluated in-process.
pub const WELL_KNOWN_FIELDS: &[&str] = &[
    "filename",
    "content_type",
    "lang",
    "source",
    "author",
    "title",
];

fn slug_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid slug regex"))
}

fn docid_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid docid regex")
    })
}

/// Validate a tenant or collection slug (lowercase, URL-safe).
pub fn validate_slug(kind: &str, value: &str) -> EngineResult<()> {
    if slug_re().is_match(value) {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!(
            "{kind} '{value}' is not a valid slug (expected [a-z0-9][a-z0-9_-]*, max 64 chars)"
        )))
    }
}

/// Validate a caller-supplied document identifier. The `::` separator is
/// reserved for rid construction, so it can never appear inside a docid.
pub fn validate_docid(value: &str) -> EngineResult<()> {
    if docid_re().is_match(value) {
        Ok(())
    } else {
        Err(EngineError::InvalidRequest(format!(
            "docid '{value}' is not valid (expected [A-Za-z0-9._-], max 128 chars)"
        )))
    }
}

/// Build a record id from docid and 1-based chunk ordinal.
pub fn rid(docid: &str, ordinal: u32) -> String {
    format!("{docid}::{ordinal}")
}

/// Split a rid back into `(docid, ordinal)`.
pub fn split_rid(rid: &str) -> Option<(&str, u32)> {
    let (docid, ord) = rid.rsplit_once("::")?;
    Some((docid, ord.parse().ok()?))
}

/// Derive a docid from a filename: the stem with anything outside the docid
/// alphabet collapsed to `-`. Returns `None` when nothing usable remains.
pub fn docid_from_filename(filename: &str) -> Option<String> {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())?;
    let mapped: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches(|c| c == '-' || c == '.').to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Round a duration to milliseconds with two decimal places.
pub fn latency_ms(elapsed: std::time::Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

/// Document-level metadata: a closed set of well-known fields plus an open
/// `extra` map. Well-known fields are denormalised into the vector backend
/// and are therefore pre-filterable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl DocMeta {
    /// Fold caller-supplied metadata into this record. Well-known string
    /// fields land in their typed slots; everything else goes to `extra`.
    /// Caller values win over derived ones.
    pub fn merge_from(&mut self, supplied: &Map<String, Value>) {
        for (key, value) in supplied {
            let as_str = value.as_str().map(str::to_string);
            match (key.as_str(), as_str) {
                ("filename", Some(s)) => self.filename = Some(s),
                ("content_type", Some(s)) => self.content_type = Some(s),
                ("lang", Some(s)) => self.lang = Some(s),
                ("source", Some(s)) => self.source = Some(s),
                ("author", Some(s)) => self.author = Some(s),
                ("title", Some(s)) => self.title = Some(s),
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Look up a field by name, well-known slots first.
    pub fn get(&self, field: &str) -> Option<Value> {
        let slot = match field {
            "filename" => &self.filename,
            "content_type" => &self.content_type,
            "lang" => &self.lang,
            "source" => &self.source,
            "author" => &self.author,
            "title" => &self.title,
            _ => return self.extra.get(field).cloned(),
        };
        slot.as_ref().map(|s| Value::String(s.clone()))
    }

    /// Flatten into a JSON map (well-known fields plus extras).
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for field in WELL_KNOWN_FIELDS {
            if let Some(v) = self.get(field) {
                map.insert((*field).to_string(), v);
            }
        }
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        map
    }
}

/// Per-chunk metadata: only genuinely per-chunk fields live here; document
/// level fields are joined at read time from [`DocMeta`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ChunkMeta {
    pub fn get(&self, field: &str) -> Option<Value> {
        match field {
            "page" => self.page.map(Value::from),
            "offset" => self.offset.map(Value::from),
            "row" => self.row.map(Value::from),
            "section" => self.section.clone().map(Value::String),
            _ => self.extra.get(field).cloned(),
        }
    }
}

/// Merge document and chunk metadata into the flat map returned on hits.
/// Chunk fields win on collision.
pub fn merged_meta(doc: &DocMeta, chunk: &ChunkMeta) -> Map<String, Value> {
    let mut map = doc.to_map();
    if let Some(page) = chunk.page {
        map.insert("page".to_string(), Value::from(page));
    }
    if let Some(offset) = chunk.offset {
        map.insert("offset".to_string(), Value::from(offset));
    }
    if let Some(row) = chunk.row {
        map.insert("row".to_string(), Value::from(row));
    }
    if let Some(section) = &chunk.section {
        map.insert("section".to_string(), Value::String(section.clone()));
    }
    for (k, v) in &chunk.extra {
        map.insert(k.clone(), v.clone());
    }
    map
}

/// A single search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub meta: Map<String, Value>,
    pub match_reason: String,
    pub docid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Search response envelope returned by the facade.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<SearchMatch>,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub truncated: bool,
}

/// Receipt for a completed ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub docid: String,
    pub chunks: usize,
    pub latency_ms: f64,
}

/// Receipt for a document deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteReceipt {
    pub chunks_deleted: usize,
}

/// Point-in-time collection counters for readiness checks.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub chunks: usize,
}
