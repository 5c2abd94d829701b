use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};
use crate::types::{ChunkMeta, DocMeta};

/// Current on-disk generation of `metadata.json`.
const SCHEMA_VERSION: u32 = 2;
const META_FILE: &str = "metadata.json";
/// First-generation layout; detected and refused rather than migrated.
const LEGACY_META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub version: u32,
    pub ingested_at: DateTime<Utc>,
    pub meta: DocMeta,
    pub rids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub docid: String,
    pub meta: ChunkMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaFile {
    schema: u32,
    docs: BTreeMap<String, DocRecord>,
    chunks: BTreeMap<String, ChunkRow>,
}

impl Default for MetaFile {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            docs: BTreeMap::new(),
            chunks: BTreeMap::new(),
        }
    }
}

/// A chunk joined with its document record, as returned by batch hydration.
#[derive(Debug, Clone)]
pub struct HydratedChunk {
    pub docid: String,
    pub version: u32,
    pub doc: DocMeta,
    pub chunk: ChunkMeta,
}

/// Per-collection durable metadata map.
///
/// In-memory maps behind a read-write lock, persisted as a single JSON
/// document via write-temp-then-rename. Readers never block writers and
/// observe either the full pre-write or the full post-write state: writers
/// mutate a clone, persist it, and only then swap it in.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    inner: RwLock<MetaFile>,
}

impl MetaStore {
    /// Initialise an empty store for a freshly created collection.
    pub fn create(collection_dir: &Path) -> EngineResult<Self> {
        let store = Self {
            path: collection_dir.join(META_FILE),
            inner: RwLock::new(MetaFile::default()),
        };
        persist(&store.path, &store.inner.read())?;
        Ok(store)
    }

    /// Open an existing store, refusing legacy layouts.
    pub fn open(collection_dir: &Path) -> EngineResult<Self> {
        if collection_dir.join(LEGACY_META_FILE).exists() {
            return Err(EngineError::LegacyMetadata(format!(
                "collection at {} uses the pre-v2 '{LEGACY_META_FILE}' layout; \
                 re-ingest the collection or migrate it with a release that still reads v1",
                collection_dir.display()
            )));
        }

        let path = collection_dir.join(META_FILE);
        if !path.exists() {
            // Collection created before any write landed; start empty.
            return Ok(Self {
                path,
                inner: RwLock::new(MetaFile::default()),
            });
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(EngineError::Internal)?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))
            .map_err(EngineError::Internal)?;

        match value.get("schema").and_then(|v| v.as_u64()) {
            Some(v) if v == SCHEMA_VERSION as u64 => {}
            found => {
                return Err(EngineError::LegacyMetadata(format!(
                    "metadata schema {:?} at {} does not match expected v{SCHEMA_VERSION}; \
                     re-ingest the collection or migrate it with matching tooling",
                    found,
                    path.display()
                )))
            }
        }

        let file: MetaFile = serde_json::from_value(value)
            .with_context(|| format!("failed to decode {}", path.display()))
            .map_err(EngineError::Internal)?;
        Ok(Self {
            path,
            inner: RwLock::new(file),
        })
    }

    /// Replace all chunks of `docid` atomically and bump its version
    /// counter. Returns the new version (1 on first ingest).
    pub fn upsert_chunks(
        &self,
        docid: &str,
        chunks: &[(String, ChunkMeta)],
        doc_meta: DocMeta,
    ) -> EngineResult<u32> {
        let mut guard = self.inner.write();
        let mut next = guard.clone();

        let version = next.docs.get(docid).map(|d| d.version + 1).unwrap_or(1);
        if let Some(prior) = next.docs.remove(docid) {
            for rid in &prior.rids {
                next.chunks.remove(rid);
            }
        }

        let mut rids = Vec::with_capacity(chunks.len());
        for (rid, meta) in chunks {
            rids.push(rid.clone());
            next.chunks.insert(
                rid.clone(),
                ChunkRow {
                    docid: docid.to_string(),
                    meta: meta.clone(),
                },
            );
        }
        next.docs.insert(
            docid.to_string(),
            DocRecord {
                version,
                ingested_at: Utc::now(),
                meta: doc_meta,
                rids,
            },
        );

        persist(&self.path, &next)?;
        *guard = next;
        Ok(version)
    }

    /// Remove a document and all its chunk rows. Returns the rids removed;
    /// empty (and no error) when the docid is unknown.
    pub fn delete_doc(&self, docid: &str) -> EngineResult<Vec<String>> {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        let Some(record) = next.docs.remove(docid) else {
            return Ok(Vec::new());
        };
        for rid in &record.rids {
            next.chunks.remove(rid);
        }
        persist(&self.path, &next)?;
        *guard = next;
        Ok(record.rids)
    }

    pub fn has_doc(&self, docid: &str) -> bool {
        self.inner.read().docs.contains_key(docid)
    }

    pub fn get_rids(&self, docid: &str) -> Vec<String> {
        self.inner
            .read()
            .docs
            .get(docid)
            .map(|d| d.rids.clone())
            .unwrap_or_default()
    }

    pub fn get_doc_version(&self, docid: &str) -> Option<u32> {
        self.inner.read().docs.get(docid).map(|d| d.version)
    }

    /// Batch lookup joining chunk rows with their document records. Unknown
    /// rids are simply absent from the result.
    pub fn get_meta_batch(&self, rids: &[String]) -> HashMap<String, HydratedChunk> {
        let guard = self.inner.read();
        let mut out = HashMap::with_capacity(rids.len());
        for rid in rids {
            let Some(row) = guard.chunks.get(rid) else {
                continue;
            };
            let Some(doc) = guard.docs.get(&row.docid) else {
                continue;
            };
            out.insert(
                rid.clone(),
                HydratedChunk {
                    docid: row.docid.clone(),
                    version: doc.version,
                    doc: doc.meta.clone(),
                    chunk: row.meta.clone(),
                },
            );
        }
        out
    }

    pub fn doc_count(&self) -> usize {
        self.inner.read().docs.len()
    }
}

fn persist(path: &Path, file: &MetaFile) -> EngineResult<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_string(file)
        .context("failed to serialize metadata")
        .map_err(EngineError::Internal)?;
    std::fs::write(&tmp, data)
        .with_context(|| format!("failed to write {}", tmp.display()))
        .map_err(EngineError::Internal)?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))
        .map_err(EngineError::Internal)?;
    Ok(())
}
