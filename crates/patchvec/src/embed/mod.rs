pub mod hash;

use anyhow::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::config::EmbedderConfig;
use crate::error::{EngineError, EngineResult};

/// Unified embedding model trait. The engine never assumes a specific model;
/// anything that can turn text into dense vectors of a fixed dimension fits.
pub trait Embedder: Send + Sync {
    /// Embed a search query.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a document/passage for indexing.
    fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Batch embed documents for ingestion.
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_document(t)).collect()
    }

    /// Embedding vector dimension.
    fn dimension(&self) -> usize;

    /// Model identity written into the index; mismatches are fatal on load.
    fn fingerprint(&self) -> String;
}

impl std::fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("fingerprint", &self.fingerprint())
            .field("dimension", &self.dimension())
            .finish()
    }
}

/// Query-side LRU cache in front of any embedder. Documents are embedded
/// once at ingest and never repeat, so only queries are cached.
pub struct CachedEmbedder<E> {
    inner: E,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero cache capacity");
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.lock().get(text) {
            return Ok(hit.clone());
        }
        let vector = self.inner.embed_query(text)?;
        self.cache.lock().put(text.to_string(), vector.clone());
        Ok(vector)
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed_document(text)
    }

    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.inner.embed_documents(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }
}

const QUERY_CACHE_CAPACITY: usize = 1024;

/// Build the embedder described by configuration.
///
/// This is the collaborator seam: per-collection models can be introduced
/// later by resolving a different config per collection without touching the
/// engine.
pub fn embedder_for(config: &EmbedderConfig) -> EngineResult<Arc<dyn Embedder>> {
    match config.kind.as_str() {
        "hash" => {
            let dim = hash::dimension_from_model(&config.model).ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "embedder.model '{}' is not a valid hash model (expected 'hash-<dim>')",
                    config.model
                ))
            })?;
            Ok(Arc::new(CachedEmbedder::new(
                hash::HashEmbedder::new(dim),
                QUERY_CACHE_CAPACITY,
            )))
        }
        other => Err(EngineError::InvalidRequest(format!(
            "embedder.type '{other}' is not supported"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbedderConfig;

    #[test]
    fn provider_builds_hash_embedder() {
        let embedder = embedder_for(&EmbedderConfig {
            kind: "hash".into(),
            model: "hash-128".into(),
        })
        .unwrap();
        assert_eq!(embedder.dimension(), 128);
        assert_eq!(embedder.fingerprint(), "hash-128");
    }

    #[test]
    fn provider_rejects_unknown_type() {
        let err = embedder_for(&EmbedderConfig {
            kind: "onnx".into(),
            model: "e5-base".into(),
        })
        .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn cache_returns_identical_vectors() {
        let embedder = CachedEmbedder::new(hash::HashEmbedder::new(64), 4);
        let a = embedder.embed_query("captain nemo").unwrap();
        let b = embedder.embed_query("captain nemo").unwrap();
        assert_eq!(a, b);
    }
}
