use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::admission::AdmissionController;
use crate::catalog::Catalog;
use crate::collection::{self, Collection, CollectionState};
use crate::config::PatchvecConfig;
use crate::embed::{embedder_for, hash::tokenize, Embedder};
use crate::error::{EngineError, EngineResult};
use crate::filter::planner::{plan, BackendCaps};
use crate::filter::{post, FilterMap};
use crate::metastore::HydratedChunk;
use crate::opslog::{OpsEvent, OpsLog};
use crate::preprocess::{preprocess, SourceDocument};
use crate::store::{IndexedFields, VectorRow};
use crate::types::{
    self, latency_ms, merged_meta, CollectionStats, DeleteReceipt, IngestReceipt, SearchMatch,
    SearchResponse,
};

type Key = (String, String);

/// Registry entry for one collection: the mutual-exclusion lock serialising
/// writes (and the k-NN section of reads) plus the lazily opened instance.
/// `transition` marks an in-flight create or delete so concurrent callers
/// fail fast with `unavailable` instead of queueing on the lock.
struct Slot {
    lock: tokio::sync::Mutex<()>,
    inner: RwLock<Option<Arc<Collection>>>,
    transition: RwLock<Option<CollectionState>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            inner: RwLock::new(None),
            transition: RwLock::new(None),
        }
    }

    fn begin_transition(&self, state: CollectionState) {
        *self.transition.write() = Some(state);
    }

    fn end_transition(&self) {
        *self.transition.write() = None;
    }

    fn ensure_available(&self) -> EngineResult<()> {
        match *self.transition.read() {
            Some(CollectionState::Initializing) => Err(EngineError::Unavailable(
                "collection is initializing".to_string(),
            )),
            Some(CollectionState::Deleting) => Err(EngineError::Unavailable(
                "collection is being deleted".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// The collection engine and service facade.
///
/// Immutable after [`build_engine`]; transports hold a shared reference and
/// call the operations below. One engine owns one data directory.
pub struct Engine {
    config: PatchvecConfig,
    catalog: Catalog,
    registry: Mutex<HashMap<Key, Arc<Slot>>>,
    admission: AdmissionController,
    embedder: Arc<dyn Embedder>,
    caps: BackendCaps,
    ops: OpsLog,
}

/// Build an engine from configuration. No global state: everything the
/// engine needs lives in the returned value.
pub async fn build_engine(config: PatchvecConfig) -> EngineResult<Engine> {
    config
        .validate()
        .map_err(EngineError::InvalidRequest)?;

    let data_dir: PathBuf = config.vector_store.data_dir.clone();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))
        .map_err(EngineError::Internal)?;

    let embedder = embedder_for(&config.embedder)?;
    let ops = match config.log.ops_log.as_deref() {
        Some(target) => OpsLog::start(target)?,
        None => OpsLog::disabled(),
    };

    tracing::info!(
        data_dir = %data_dir.display(),
        model = %embedder.fingerprint(),
        "engine ready"
    );

    Ok(Engine {
        admission: AdmissionController::new(&config.limits),
        catalog: Catalog::new(data_dir),
        registry: Mutex::new(HashMap::new()),
        embedder,
        caps: BackendCaps::lance(),
        ops,
        config,
    })
}

impl Engine {
    pub fn config(&self) -> &PatchvecConfig {
        &self.config
    }

    pub fn ops(&self) -> &OpsLog {
        &self.ops
    }

    /// Embedder seam: resolved per collection so per-collection models can
    /// be introduced without changing callers.
    fn embedder_for(&self, _tenant: &str, _name: &str) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Read-or-create the registry slot. The registry mutex is the only
    /// process-wide guard; it is never held across an await.
    fn slot(&self, tenant: &str, name: &str) -> Arc<Slot> {
        let mut registry = self.registry.lock();
        registry
            .entry((tenant.to_string(), name.to_string()))
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Resolve a collection, opening it from disk on first touch.
    async fn resolve(
        &self,
        tenant: &str,
        name: &str,
    ) -> EngineResult<(Arc<Slot>, Arc<Collection>)> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", name)?;
        let slot = self.slot(tenant, name);
        slot.ensure_available()?;

        let open = slot.inner.read().clone();
        if let Some(col) = open {
            return Ok((slot, col));
        }

        let _guard = slot.lock.lock().await;
        let open = slot.inner.read().clone();
        if let Some(col) = open {
            return Ok((slot.clone(), col));
        }

        let dir = self.catalog.collection_dir(tenant, name);
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "collection '{tenant}/{name}'"
            )));
        }
        let embedder = self.embedder_for(tenant, name);
        let col = Arc::new(
            Collection::open(&dir, &embedder.fingerprint(), embedder.dimension()).await?,
        );
        *slot.inner.write() = Some(col.clone());
        Ok((slot.clone(), col))
    }

    // ── Collection lifecycle ──────────────────────────────────────────

    pub async fn create_collection(&self, tenant: &str, name: &str) -> EngineResult<()> {
        let started = Instant::now();
        let result = self.create_collection_inner(tenant, name).await;
        self.emit(
            OpsEvent::new("create_collection", tenant).collection(name),
            started,
            result.as_ref().err(),
        );
        result
    }

    async fn create_collection_inner(&self, tenant: &str, name: &str) -> EngineResult<()> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", name)?;
        let slot = self.slot(tenant, name);
        slot.ensure_available()?;
        let _guard = slot.lock.lock().await;

        let dir = self.catalog.collection_dir(tenant, name);
        if dir.exists() {
            return Err(EngineError::AlreadyExists(format!(
                "collection '{tenant}/{name}'"
            )));
        }

        // Concurrent operations observe `unavailable` until creation lands.
        slot.begin_transition(CollectionState::Initializing);
        let embedder = self.embedder_for(tenant, name);
        let result =
            Collection::create(&dir, tenant, name, &embedder.fingerprint(), embedder.dimension())
                .await;
        let col = match result {
            Ok(col) => col,
            Err(e) => {
                slot.end_transition();
                return Err(e);
            }
        };
        *slot.inner.write() = Some(Arc::new(col));
        slot.end_transition();
        Ok(())
    }

    pub async fn delete_collection(&self, tenant: &str, name: &str) -> EngineResult<()> {
        let started = Instant::now();
        let result = self.delete_collection_inner(tenant, name).await;
        self.emit(
            OpsEvent::new("delete_collection", tenant).collection(name),
            started,
            result.as_ref().err(),
        );
        result
    }

    async fn delete_collection_inner(&self, tenant: &str, name: &str) -> EngineResult<()> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", name)?;
        let slot = self.slot(tenant, name);
        slot.ensure_available()?;
        let _guard = slot.lock.lock().await;

        let dir = self.catalog.collection_dir(tenant, name);
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "collection '{tenant}/{name}'"
            )));
        }

        slot.begin_transition(CollectionState::Deleting);
        if let Some(col) = slot.inner.write().take() {
            col.set_state(CollectionState::Deleting);
        }
        let removed = std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove {}", dir.display()))
            .map_err(EngineError::Internal);
        slot.end_transition();
        removed?;
        self.prune_tenant_dir(tenant);

        tracing::info!(tenant, collection = name, "deleted collection");
        Ok(())
    }

    /// Remove the tenant directory once its last collection is gone, so an
    /// empty tenant stops existing.
    fn prune_tenant_dir(&self, tenant: &str) {
        let tenant_dir = self.catalog.tenant_dir(tenant);
        if let Ok(mut entries) = std::fs::read_dir(&tenant_dir) {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(&tenant_dir);
            }
        }
    }

    pub async fn rename_collection(
        &self,
        tenant: &str,
        old: &str,
        new: &str,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let result = self.rename_collection_inner(tenant, old, new).await;
        let mut event = OpsEvent::new("rename_collection", tenant).collection(old);
        event.new_name = Some(new.to_string());
        self.emit(event, started, result.as_ref().err());
        result
    }

    async fn rename_collection_inner(
        &self,
        tenant: &str,
        old: &str,
        new: &str,
    ) -> EngineResult<()> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", old)?;
        types::validate_slug("collection", new)?;

        // Only the old collection's lock is ever held; the renamed
        // collection reopens lazily under its own slot.
        let slot = self.slot(tenant, old);
        slot.ensure_available()?;
        let _guard = slot.lock.lock().await;

        let old_dir = self.catalog.collection_dir(tenant, old);
        let new_dir = self.catalog.collection_dir(tenant, new);
        if !old_dir.is_dir() {
            return Err(EngineError::NotFound(format!("collection '{tenant}/{old}'")));
        }
        if new_dir.exists() {
            return Err(EngineError::AlreadyExists(format!(
                "collection '{tenant}/{new}'"
            )));
        }

        // Drop the open instance so its handles are released before the move.
        if let Some(col) = slot.inner.write().take() {
            col.set_state(CollectionState::Deleting);
        }
        std::fs::rename(&old_dir, &new_dir)
            .with_context(|| {
                format!(
                    "failed to rename {} to {}",
                    old_dir.display(),
                    new_dir.display()
                )
            })
            .map_err(EngineError::Internal)?;

        let mut manifest = collection::read_manifest(&new_dir)?;
        manifest.name = new.to_string();
        collection::write_manifest(&new_dir, &manifest)?;

        tracing::info!(tenant, from = old, to = new, "renamed collection");
        Ok(())
    }

    pub fn list_tenants(&self) -> EngineResult<Vec<String>> {
        self.catalog.list_tenants()
    }

    pub fn list_collections(&self, tenant: &str) -> EngineResult<Vec<String>> {
        let started = Instant::now();
        let result = types::validate_slug("tenant", tenant)
            .and_then(|_| self.catalog.list_collections(tenant));
        self.emit(
            OpsEvent::new("list_collections", tenant),
            started,
            result.as_ref().err(),
        );
        result
    }

    pub async fn stats(&self, tenant: &str, name: &str) -> EngineResult<CollectionStats> {
        let (_slot, col) = self.resolve(tenant, name).await?;
        let chunks = col.backend.count().await.map_err(EngineError::Internal)?;
        Ok(CollectionStats { chunks })
    }

    // ── Ingest / delete ───────────────────────────────────────────────

    pub async fn ingest_document(
        &self,
        tenant: &str,
        name: &str,
        source: SourceDocument,
        docid: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> EngineResult<IngestReceipt> {
        let started = Instant::now();
        let result = self
            .ingest_inner(tenant, name, source, docid, metadata, started)
            .await;
        let mut event = OpsEvent::new("ingest", tenant).collection(name);
        if let Ok(receipt) = &result {
            event.docid = Some(receipt.docid.clone());
            event.chunks = Some(receipt.chunks);
        }
        self.emit(event, started, result.as_ref().err());
        result
    }

    async fn ingest_inner(
        &self,
        tenant: &str,
        name: &str,
        source: SourceDocument,
        docid: Option<String>,
        metadata: Option<Map<String, Value>>,
        started: Instant,
    ) -> EngineResult<IngestReceipt> {
        let _permit = self.admission.admit_ingest(tenant)?;

        let limit = self.config.limits.ingest.max_bytes;
        if source.bytes.len() > limit {
            return Err(EngineError::TooLarge {
                size: source.bytes.len(),
                limit,
            });
        }

        let (slot, col) = self.resolve(tenant, name).await?;

        let docid = match docid {
            Some(explicit) => {
                types::validate_docid(&explicit)?;
                explicit
            }
            None => source
                .filename
                .as_deref()
                .and_then(types::docid_from_filename)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let prepared = preprocess(&source, &self.config.chunk.txt)?;
        let mut doc_meta = prepared.meta;
        if let Some(supplied) = &metadata {
            doc_meta.merge_from(supplied);
        }

        // Embedding happens before the lock; only index and store writes
        // are serialised.
        let embedder = self.embedder_for(tenant, name);
        let texts: Vec<&str> = prepared.chunks.iter().map(|c| c.text.as_str()).collect();
        let embeddings = embedder
            .embed_documents(&texts)
            .context("embedding failed")
            .map_err(EngineError::Internal)?;

        let now = chrono::Utc::now().timestamp();
        let fields = IndexedFields::from_doc_meta(&doc_meta);
        let mut rows = Vec::with_capacity(prepared.chunks.len());
        let mut chunk_rows = Vec::with_capacity(prepared.chunks.len());
        for (i, (chunk, vector)) in prepared.chunks.iter().zip(embeddings).enumerate() {
            let ordinal = i as u32 + 1;
            let rid = types::rid(&docid, ordinal);
            rows.push(VectorRow {
                rid: rid.clone(),
                docid: docid.clone(),
                ordinal,
                page: chunk.meta.page.map(|p| p as i32),
                text: chunk.text.clone(),
                vector,
                fields: fields.clone(),
                created_at: now,
            });
            chunk_rows.push((rid, chunk.meta.clone()));
        }
        let new_rids: Vec<String> = chunk_rows.iter().map(|(rid, _)| rid.clone()).collect();

        let _guard = slot.lock.lock().await;
        col.ensure_ready()?;

        // Purge any prior version of this docid first; re-ingest replaces.
        let old_rids = col.meta.get_rids(&docid);
        if !old_rids.is_empty() {
            col.backend
                .delete(&old_rids)
                .await
                .context("failed to purge prior document version")
                .map_err(EngineError::Internal)?;
            col.sidecar.remove(&old_rids);
        }

        col.backend
            .upsert(rows)
            .await
            .context("vector upsert failed")
            .map_err(EngineError::Internal)?;

        let mut written = Vec::with_capacity(chunk_rows.len());
        for ((rid, _), chunk) in chunk_rows.iter().zip(&prepared.chunks) {
            if let Err(e) = col.sidecar.write(rid, &chunk.text) {
                self.rollback_ingest(&col, &new_rids, &written).await;
                return Err(EngineError::Internal(e));
            }
            written.push(rid.clone());
        }

        // Metadata commit is the visibility point; on failure the backend
        // upsert is rolled back before the lock is released.
        let version = match col.meta.upsert_chunks(&docid, &chunk_rows, doc_meta) {
            Ok(version) => version,
            Err(e) => {
                self.rollback_ingest(&col, &new_rids, &written).await;
                return Err(e);
            }
        };
        drop(_guard);

        tracing::info!(
            tenant,
            collection = name,
            docid = %docid,
            chunks = chunk_rows.len(),
            version,
            "ingested document"
        );

        Ok(IngestReceipt {
            docid,
            chunks: chunk_rows.len(),
            latency_ms: latency_ms(started.elapsed()),
        })
    }

    async fn rollback_ingest(&self, col: &Collection, rids: &[String], written: &[String]) {
        if let Err(e) = col.backend.delete(rids).await {
            tracing::warn!(error = %e, "failed to roll back vector upsert");
        }
        col.sidecar.remove(written);
    }

    pub async fn delete_document(
        &self,
        tenant: &str,
        name: &str,
        docid: &str,
    ) -> EngineResult<DeleteReceipt> {
        let started = Instant::now();
        let result = self.delete_document_inner(tenant, name, docid).await;
        let mut event = OpsEvent::new("delete_doc", tenant).collection(name);
        event.docid = Some(docid.to_string());
        if let Ok(receipt) = &result {
            event.chunks = Some(receipt.chunks_deleted);
        }
        self.emit(event, started, result.as_ref().err());
        result
    }

    async fn delete_document_inner(
        &self,
        tenant: &str,
        name: &str,
        docid: &str,
    ) -> EngineResult<DeleteReceipt> {
        let (slot, col) = self.resolve(tenant, name).await?;
        let _guard = slot.lock.lock().await;
        col.ensure_ready()?;

        let rids = col.meta.get_rids(docid);
        if rids.is_empty() {
            // Idempotent: deleting a missing document is not an error.
            return Ok(DeleteReceipt { chunks_deleted: 0 });
        }

        col.backend
            .delete(&rids)
            .await
            .context("vector delete failed")
            .map_err(EngineError::Internal)?;
        col.sidecar.remove(&rids);
        col.meta.delete_doc(docid)?;

        tracing::info!(tenant, collection = name, docid, chunks = rids.len(), "deleted document");
        Ok(DeleteReceipt {
            chunks_deleted: rids.len(),
        })
    }

    // ── Search ────────────────────────────────────────────────────────

    pub async fn search(
        &self,
        tenant: &str,
        name: &str,
        query: &str,
        k: usize,
        filters: Option<&FilterMap>,
        request_id: Option<String>,
    ) -> EngineResult<SearchResponse> {
        let started = Instant::now();
        let result = self
            .search_inner(tenant, name, query, k, filters, request_id, started)
            .await;
        let mut event = OpsEvent::new("search", tenant).collection(name);
        event.k = Some(k);
        if let Ok(response) = &result {
            event.hits = Some(response.matches.len());
            event.request_id = response.request_id.clone();
        }
        self.emit(event, started, result.as_ref().err());
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn search_inner(
        &self,
        tenant: &str,
        name: &str,
        query: &str,
        k: usize,
        filters: Option<&FilterMap>,
        request_id: Option<String>,
        started: Instant,
    ) -> EngineResult<SearchResponse> {
        if k == 0 {
            return Err(EngineError::InvalidRequest("k must be >= 1".to_string()));
        }
        let _permit = self.admission.admit_search(tenant)?;
        let (slot, col) = self.resolve(tenant, name).await?;

        let empty = FilterMap::new();
        let filters = filters.unwrap_or(&empty);
        let filter_plan = plan(filters, &self.caps)?;

        // Query embedding is outside the collection lock.
        let embedder = self.embedder_for(tenant, name);
        let query_vector = embedder
            .embed_query(query)
            .context("query embedding failed")
            .map_err(EngineError::Internal)?;

        let overfetch = if filter_plan.post.is_empty() {
            1
        } else {
            self.config.limits.search.overfetch
        };
        let fetch = k.saturating_mul(overfetch);
        let timeout = Duration::from_millis(self.config.limits.search.timeout_ms);
        let deadline = started + timeout;

        // The lock covers only the k-NN call. The backend gets the full
        // timeout window even when earlier stages or lock contention
        // consumed budget; the request deadline below decides whether a
        // completed search is reported as truncated.
        let candidates = {
            let _guard = slot.lock.lock().await;
            col.ensure_ready()?;
            match tokio::time::timeout(
                timeout,
                col.backend
                    .search(&query_vector, fetch, filter_plan.pre_sql.as_deref()),
            )
            .await
            {
                Err(_) => {
                    return Err(EngineError::Timeout(format!(
                        "search exceeded {}ms with no candidates",
                        self.config.limits.search.timeout_ms
                    )))
                }
                Ok(result) => result
                    .context("vector search failed")
                    .map_err(EngineError::Internal)?,
            }
        };

        // Hydration and post-filtering run without the lock.
        let had_candidates = !candidates.is_empty();
        let rids: Vec<String> = candidates.iter().map(|c| c.rid.clone()).collect();
        let hydrated = col.meta.get_meta_batch(&rids);

        let mut survivors = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let docid = types::split_rid(&candidate.rid)
                .map(|(d, _)| d.to_string())
                .unwrap_or_default();
            let chunk = hydrated.get(&candidate.rid);
            let passes = filter_plan
                .post
                .iter()
                .all(|(field, spec)| post::eval(spec, lookup_field(field, &docid, chunk).as_ref()));
            if passes {
                survivors.push((candidate, docid));
            }
        }

        // Rank: score descending, ascending rid as the deterministic
        // tie-break.
        survivors.sort_by(|(a, _), (b, _)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.rid.cmp(&b.rid))
        });
        survivors.truncate(k);

        let truncated = Instant::now() >= deadline;
        if truncated && !had_candidates {
            return Err(EngineError::Timeout(format!(
                "search exceeded {}ms with no candidates",
                self.config.limits.search.timeout_ms
            )));
        }

        let mut matches = Vec::with_capacity(survivors.len());
        for (candidate, docid) in survivors {
            let chunk = hydrated.get(&candidate.rid);
            // Prefer backend payload text; the sidecar is the fallback.
            let text = match candidate.text.filter(|t| !t.is_empty()) {
                Some(text) => text,
                None => col.sidecar.read(&candidate.rid).unwrap_or_else(|| {
                    tracing::warn!(rid = %candidate.rid, "chunk text missing from backend and sidecar");
                    String::new()
                }),
            };
            let meta = chunk
                .map(|h| merged_meta(&h.doc, &h.chunk))
                .unwrap_or_default();
            let match_reason = match_reason(filters, query, &text);
            matches.push(SearchMatch {
                id: candidate.rid.clone(),
                score: candidate.score,
                page: chunk.and_then(|h| h.chunk.page),
                offset: chunk.and_then(|h| h.chunk.offset),
                text,
                meta,
                match_reason,
                docid,
            });
        }

        Ok(SearchResponse {
            matches,
            latency_ms: latency_ms(started.elapsed()),
            request_id,
            truncated,
        })
    }

    // ── Archive / restore ─────────────────────────────────────────────

    /// Snapshot the whole collection directory as one opaque zip archive.
    pub async fn archive(&self, tenant: &str, name: &str) -> EngineResult<Vec<u8>> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", name)?;
        let slot = self.slot(tenant, name);
        slot.ensure_available()?;
        let _guard = slot.lock.lock().await;

        let dir = self.catalog.collection_dir(tenant, name);
        if !dir.is_dir() {
            return Err(EngineError::NotFound(format!(
                "collection '{tenant}/{name}'"
            )));
        }
        let open = slot.inner.read().clone();
        if let Some(col) = open {
            col.backend.flush().await.map_err(EngineError::Internal)?;
        }

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for entry in WalkDir::new(&dir) {
            let entry = entry
                .context("failed to walk collection dir")
                .map_err(EngineError::Internal)?;
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .context("path outside collection dir")
                .map_err(EngineError::Internal)?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel_name = rel.to_string_lossy().replace('\\', "/");
            if entry.file_type().is_dir() {
                zip.add_directory(rel_name, SimpleFileOptions::default())
                    .context("failed to add archive directory")
                    .map_err(EngineError::Internal)?;
            } else {
                zip.start_file(rel_name, SimpleFileOptions::default())
                    .context("failed to start archive entry")
                    .map_err(EngineError::Internal)?;
                let data = std::fs::read(entry.path())
                    .with_context(|| format!("failed to read {}", entry.path().display()))
                    .map_err(EngineError::Internal)?;
                zip.write_all(&data)
                    .context("failed to write archive entry")
                    .map_err(EngineError::Internal)?;
            }
        }
        let cursor = zip
            .finish()
            .context("failed to finish archive")
            .map_err(EngineError::Internal)?;

        tracing::info!(tenant, collection = name, "archived collection");
        Ok(cursor.into_inner())
    }

    /// Replace the collection with the contents of an archive. Destructive:
    /// existing state is removed first.
    pub async fn restore(&self, tenant: &str, name: &str, bytes: &[u8]) -> EngineResult<()> {
        types::validate_slug("tenant", tenant)?;
        types::validate_slug("collection", name)?;
        let slot = self.slot(tenant, name);
        slot.ensure_available()?;
        let _guard = slot.lock.lock().await;

        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| EngineError::InvalidRequest(format!("not a valid archive: {e}")))?;

        slot.begin_transition(CollectionState::Deleting);
        if let Some(col) = slot.inner.write().take() {
            col.set_state(CollectionState::Deleting);
        }
        let dir = self.catalog.collection_dir(tenant, name);
        let result = self.restore_contents(tenant, name, &dir, &mut archive);
        slot.end_transition();
        result
    }

    fn restore_contents(
        &self,
        tenant: &str,
        name: &str,
        dir: &std::path::Path,
        archive: &mut ZipArchive<Cursor<&[u8]>>,
    ) -> EngineResult<()> {
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear {}", dir.display()))
                .map_err(EngineError::Internal)?;
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))
            .map_err(EngineError::Internal)?;
        archive
            .extract(&dir)
            .context("failed to extract archive")
            .map_err(EngineError::Internal)?;

        if !collection::manifest_path(&dir).exists() {
            let _ = std::fs::remove_dir_all(&dir);
            self.prune_tenant_dir(tenant);
            return Err(EngineError::InvalidRequest(
                "archive does not contain a collection manifest".to_string(),
            ));
        }

        // Restores may come from a differently named source collection;
        // the manifest follows the restore target.
        let mut manifest = collection::read_manifest(&dir)?;
        manifest.tenant = tenant.to_string();
        manifest.name = name.to_string();
        collection::write_manifest(&dir, &manifest)?;

        tracing::info!(tenant, collection = name, "restored collection");
        Ok(())
    }

    /// Wait for in-flight searches and ingests to finish, up to `window`.
    /// Returns false when the drain window expired with work still running;
    /// the caller then aborts.
    pub async fn drain(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        while self.admission.active_searches() + self.admission.active_ingests() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn emit(&self, mut event: OpsEvent, started: Instant, error: Option<&EngineError>) {
        event.latency_ms = latency_ms(started.elapsed());
        if let Some(e) = error {
            event = event.failed(e.code());
        }
        self.ops.emit(event);
    }
}

/// Resolve a filter field against a hit: `docid` from the rid itself,
/// per-chunk fields before document fields.
fn lookup_field(field: &str, docid: &str, chunk: Option<&HydratedChunk>) -> Option<Value> {
    if field == "docid" {
        return Some(Value::String(docid.to_string()));
    }
    let chunk = chunk?;
    chunk.chunk.get(field).or_else(|| chunk.doc.get(field))
}

/// Deterministic explanation of why a hit matched: the filters applied plus
/// up to three query terms found in the hit text.
fn match_reason(filters: &FilterMap, query: &str, text: &str) -> String {
    let mut parts = Vec::new();

    if !filters.is_empty() {
        let described: Vec<String> = filters
            .iter()
            .map(|(field, value)| match value {
                Value::String(s) => format!("{field}={s}"),
                other => format!("{field}={other}"),
            })
            .collect();
        parts.push(format!("filter {}", described.join(", ")));
    }

    let haystack = text.to_lowercase();
    let mut terms: Vec<String> = Vec::new();
    for token in tokenize(query) {
        if terms.len() == 3 {
            break;
        }
        if !terms.contains(&token) && haystack.contains(&token) {
            terms.push(token);
        }
    }
    if !terms.is_empty() {
        let quoted: Vec<String> = terms.iter().map(|t| format!("\"{t}\"")).collect();
        parts.push(format!("terms {}", quoted.join(", ")));
    }

    if parts.is_empty() {
        "vector similarity".to_string()
    } else {
        format!("matched {}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BackendHit, VectorBackend};
    use async_trait::async_trait;
    use serde_json::json;

    /// Backend double that answers after a fixed delay.
    struct DelayedBackend {
        delay: Duration,
        hits: Vec<BackendHit>,
    }

    #[async_trait]
    impl VectorBackend for DelayedBackend {
        async fn upsert(&self, _rows: Vec<VectorRow>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete(&self, _rids: &[String]) -> anyhow::Result<usize> {
            Ok(0)
        }

        async fn search(
            &self,
            _vector: &[f32],
            _k: usize,
            _pre_filter: Option<&str>,
        ) -> anyhow::Result<Vec<BackendHit>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.hits.clone())
        }

        async fn count(&self) -> anyhow::Result<usize> {
            Ok(self.hits.len())
        }

        async fn flush(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn engine_with_timeout(data_dir: &std::path::Path, timeout_ms: u64) -> Engine {
        let mut config = PatchvecConfig::default();
        config.vector_store.data_dir = data_dir.to_path_buf();
        config.embedder.model = "hash-16".to_string();
        config.limits.search.timeout_ms = timeout_ms;
        build_engine(config).await.unwrap()
    }

    /// Reopen a created collection with a doctored backend and publish it
    /// into the registry slot.
    async fn plant_backend(
        engine: &Engine,
        tenant: &str,
        name: &str,
        backend: Box<dyn VectorBackend>,
    ) {
        let dir = engine.catalog.collection_dir(tenant, name);
        let embedder = engine.embedder_for(tenant, name);
        let col = Collection::open(&dir, &embedder.fingerprint(), embedder.dimension())
            .await
            .unwrap()
            .with_backend(backend);
        let slot = engine.slot(tenant, name);
        *slot.inner.write() = Some(Arc::new(col));
    }

    #[tokio::test]
    async fn slow_backend_times_out_with_no_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_timeout(tmp.path(), 100).await;
        engine.create_collection("demo", "slow").await.unwrap();
        plant_backend(
            &engine,
            "demo",
            "slow",
            Box::new(DelayedBackend {
                delay: Duration::from_secs(5),
                hits: Vec::new(),
            }),
        )
        .await;

        let err = engine
            .search("demo", "slow", "anything", 3, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn late_candidates_return_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine_with_timeout(tmp.path(), 300).await);
        engine.create_collection("demo", "slow").await.unwrap();
        plant_backend(
            &engine,
            "demo",
            "slow",
            Box::new(DelayedBackend {
                delay: Duration::from_millis(150),
                hits: vec![BackendHit {
                    rid: "doc::1".to_string(),
                    score: 0.9,
                    text: Some("payload text".to_string()),
                }],
            }),
        )
        .await;

        // Hold the collection lock past most of the budget so the k-NN call
        // itself succeeds (150ms < 300ms window) but lands after the
        // request deadline (250ms + 150ms > 300ms).
        let slot = engine.slot("demo", "slow");
        let guard = slot.lock.lock().await;
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.search("demo", "slow", "anything", 3, None, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(guard);

        let response = task.await.unwrap().unwrap();
        assert!(response.truncated);
        assert_eq!(response.matches.len(), 1);
        assert_eq!(response.matches[0].id, "doc::1");
        assert_eq!(response.matches[0].text, "payload text");
    }

    #[tokio::test]
    async fn transitions_reject_with_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine_with_timeout(tmp.path(), 5000).await;
        engine.create_collection("demo", "busy").await.unwrap();

        let slot = engine.slot("demo", "busy");
        slot.begin_transition(CollectionState::Initializing);
        let err = engine
            .search("demo", "busy", "anything", 3, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unavailable");

        slot.begin_transition(CollectionState::Deleting);
        let err = engine.create_collection("demo", "busy").await.unwrap_err();
        assert_eq!(err.code(), "unavailable");
        let err = engine.delete_collection("demo", "busy").await.unwrap_err();
        assert_eq!(err.code(), "unavailable");

        slot.end_transition();
        let response = engine
            .search("demo", "busy", "anything", 3, None, None)
            .await
            .unwrap();
        assert!(response.matches.is_empty());
    }

    #[test]
    fn match_reason_is_deterministic() {
        let filters: FilterMap = serde_json::from_value(json!({"lang": "en"})).unwrap();
        let reason = match_reason(
            &filters,
            "captain nemo",
            "Captain Nemo stood silent at the helm.",
        );
        assert_eq!(reason, "matched filter lang=en; terms \"captain\", \"nemo\"");
        // identical inputs, identical output
        assert_eq!(
            reason,
            match_reason(
                &filters,
                "captain nemo",
                "Captain Nemo stood silent at the helm."
            )
        );
    }

    #[test]
    fn match_reason_without_signals_falls_back() {
        let filters = FilterMap::new();
        assert_eq!(
            match_reason(&filters, "quarterly revenue", "unrelated chunk text"),
            "vector similarity"
        );
    }

    #[test]
    fn match_reason_caps_terms_at_three() {
        let filters = FilterMap::new();
        let reason = match_reason(
            &filters,
            "one two three four",
            "one two three four all present",
        );
        assert_eq!(reason, "matched terms \"one\", \"two\", \"three\"");
    }

    #[test]
    fn lookup_field_resolves_docid_without_hydration() {
        assert_eq!(
            lookup_field("docid", "verne", None),
            Some(Value::String("verne".into()))
        );
        assert_eq!(lookup_field("lang", "verne", None), None);
    }
}
