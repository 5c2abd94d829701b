pub mod lance;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::DocMeta;

/// Well-known document fields denormalised into backend columns so the
/// pre-filter can run inside the k-NN query.
#[derive(Debug, Clone, Default)]
pub struct IndexedFields {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub lang: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub title: Option<String>,
}

impl IndexedFields {
    pub fn from_doc_meta(meta: &DocMeta) -> Self {
        Self {
            filename: meta.filename.clone(),
            content_type: meta.content_type.clone(),
            lang: meta.lang.clone(),
            source: meta.source.clone(),
            author: meta.author.clone(),
            title: meta.title.clone(),
        }
    }
}

/// One row of the numeric index.
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub rid: String,
    pub docid: String,
    pub ordinal: u32,
    pub page: Option<i32>,
    pub text: String,
    pub vector: Vec<f32>,
    pub fields: IndexedFields,
    pub created_at: i64,
}

/// A backend candidate: rid, similarity score (higher is better), and the
/// stored payload text when the backend keeps one.
#[derive(Debug, Clone)]
pub struct BackendHit {
    pub rid: String,
    pub score: f32,
    pub text: Option<String>,
}

/// Narrow interface the engine depends on. Any ANN index with SQL-like
/// attribute filtering satisfies it; the engine treats it as opaque.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Insert or replace rows; atomic within the call.
    async fn upsert(&self, rows: Vec<VectorRow>) -> Result<()>;

    /// Remove rows by rid; returns the number actually removed.
    async fn delete(&self, rids: &[String]) -> Result<usize>;

    /// Top-`k` rows satisfying `pre_filter`, ranked by similarity.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        pre_filter: Option<&str>,
    ) -> Result<Vec<BackendHit>>;

    /// Total row count.
    async fn count(&self) -> Result<usize>;

    /// Make pending writes durable. Lance persists on every write, so this
    /// is a checkpoint hook rather than a required flush.
    async fn flush(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn VectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorBackend").finish_non_exhaustive()
    }
}
