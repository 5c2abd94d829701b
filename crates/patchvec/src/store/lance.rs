use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

use super::{BackendHit, VectorBackend, VectorRow};

const TABLE_NAME: &str = "chunks";
const MANIFEST_FILE: &str = "backend.json";
const DELETE_BATCH: usize = 50;

/// On-disk identity of the index: dimension plus the embedding model that
/// produced the vectors. Opening with a different model is fatal.
#[derive(Debug, Serialize, Deserialize)]
struct BackendManifest {
    dimension: usize,
    fingerprint: String,
}

/// LanceDB-backed vector index with SQL predicate pushdown.
pub struct LanceBackend {
    db: lancedb::Connection,
    dimension: usize,
}

impl LanceBackend {
    /// Create or open the index under `dir`, enforcing the stored model
    /// fingerprint.
    pub async fn configure(dir: &Path, dimension: usize, fingerprint: &str) -> EngineResult<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create backend dir {}", dir.display()))
            .map_err(EngineError::Internal)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let raw = std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("failed to read {}", manifest_path.display()))
                .map_err(EngineError::Internal)?;
            let manifest: BackendManifest = serde_json::from_str(&raw)
                .context("failed to parse backend manifest")
                .map_err(EngineError::Internal)?;
            if manifest.fingerprint != fingerprint || manifest.dimension != dimension {
                return Err(EngineError::ModelMismatch {
                    stored: format!("{} (dim {})", manifest.fingerprint, manifest.dimension),
                    configured: format!("{fingerprint} (dim {dimension})"),
                });
            }
        } else {
            let manifest = BackendManifest {
                dimension,
                fingerprint: fingerprint.to_string(),
            };
            std::fs::write(
                &manifest_path,
                serde_json::to_string_pretty(&manifest).expect("manifest serializes"),
            )
            .with_context(|| format!("failed to write {}", manifest_path.display()))
            .map_err(EngineError::Internal)?;
        }

        let path = dir.to_str().ok_or_else(|| {
            EngineError::Internal(anyhow::anyhow!(
                "backend dir {} is not valid UTF-8",
                dir.display()
            ))
        })?;
        let db = lancedb::connect(path)
            .execute()
            .await
            .context("failed to connect to LanceDB")
            .map_err(EngineError::Internal)?;

        let backend = Self { db, dimension };
        backend
            .ensure_table()
            .await
            .map_err(EngineError::Internal)?;
        Ok(backend)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("rid", DataType::Utf8, false),
            Field::new("docid", DataType::Utf8, false),
            Field::new("ordinal", DataType::UInt32, false),
            Field::new("page", DataType::Int32, true),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("filename", DataType::Utf8, true),
            Field::new("content_type", DataType::Utf8, true),
            Field::new("lang", DataType::Utf8, true),
            Field::new("source", DataType::Utf8, true),
            Field::new("author", DataType::Utf8, true),
            Field::new("title", DataType::Utf8, true),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&TABLE_NAME.to_string()) {
            return Ok(());
        }

        // Create with a single seed record, then delete it: LanceDB derives
        // the table schema from the first batch.
        let schema = self.schema();
        let values = Float32Array::from(vec![0.0f32; self.dimension]);
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(Int32Array::from(vec![None::<i32>])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(StringArray::from(vec![None::<&str>])),
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .context("failed to create seed RecordBatch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(TABLE_NAME, Box::new(batches))
            .execute()
            .await
            .context("failed to create chunks table")?;

        let table = self.db.open_table(TABLE_NAME).execute().await?;
        table.delete("rid = '__seed__'").await.ok();
        Ok(())
    }

    fn build_batch(&self, rows: &[VectorRow]) -> Result<RecordBatch> {
        let schema = self.schema();

        let rids: Vec<&str> = rows.iter().map(|r| r.rid.as_str()).collect();
        let docids: Vec<&str> = rows.iter().map(|r| r.docid.as_str()).collect();
        let ordinals: Vec<u32> = rows.iter().map(|r| r.ordinal).collect();
        let pages: Vec<Option<i32>> = rows.iter().map(|r| r.page).collect();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
        let filenames: Vec<Option<&str>> =
            rows.iter().map(|r| r.fields.filename.as_deref()).collect();
        let content_types: Vec<Option<&str>> = rows
            .iter()
            .map(|r| r.fields.content_type.as_deref())
            .collect();
        let langs: Vec<Option<&str>> = rows.iter().map(|r| r.fields.lang.as_deref()).collect();
        let sources: Vec<Option<&str>> = rows.iter().map(|r| r.fields.source.as_deref()).collect();
        let authors: Vec<Option<&str>> = rows.iter().map(|r| r.fields.author.as_deref()).collect();
        let titles: Vec<Option<&str>> = rows.iter().map(|r| r.fields.title.as_deref()).collect();
        let created_ats: Vec<i64> = rows.iter().map(|r| r.created_at).collect();

        let flat_vectors: Vec<f32> = rows.iter().flat_map(|r| r.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_array = FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(rids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(docids)),
                Arc::new(UInt32Array::from(ordinals)),
                Arc::new(Int32Array::from(pages)),
                Arc::new(StringArray::from(texts)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(StringArray::from(filenames)),
                Arc::new(StringArray::from(content_types)),
                Arc::new(StringArray::from(langs)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(authors)),
                Arc::new(StringArray::from(titles)),
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("failed to build RecordBatch")
    }

    async fn delete_batched(&self, table: &lancedb::Table, rids: &[String]) -> Result<()> {
        // Batch the IN-list to keep predicates short.
        for group in rids.chunks(DELETE_BATCH) {
            let list: Vec<String> = group
                .iter()
                .map(|rid| format!("'{}'", rid.replace('\'', "''")))
                .collect();
            table
                .delete(&format!("rid IN ({})", list.join(", ")))
                .await
                .context("failed to delete rids")?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for LanceBackend {
    async fn upsert(&self, rows: Vec<VectorRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let table = self
            .db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("failed to open chunks table")?;

        // Replace-by-rid: clear any existing rows first so the call is an
        // upsert rather than an append.
        let rids: Vec<String> = rows.iter().map(|r| r.rid.clone()).collect();
        self.delete_batched(&table, &rids).await?;

        let len = rows.len();
        let batch = self.build_batch(&rows)?;
        let schema = self.schema();
        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("failed to insert chunks")?;

        tracing::debug!(rows = len, "upserted vectors into LanceDB");
        Ok(())
    }

    async fn delete(&self, rids: &[String]) -> Result<usize> {
        if rids.is_empty() {
            return Ok(0);
        }
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        self.delete_batched(&table, rids).await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before.saturating_sub(after))
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        pre_filter: Option<&str>,
    ) -> Result<Vec<BackendHit>> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;

        let mut query = table
            .query()
            .nearest_to(vector)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);
        if let Some(predicate) = pre_filter {
            query = query.only_if(predicate);
        }

        let results = query
            .execute()
            .await
            .context("LanceDB vector search failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits(&batches))
    }

    async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(TABLE_NAME).execute().await?;
        Ok(table.count_rows(None).await?)
    }

    async fn flush(&self) -> Result<()> {
        // Every add/delete above is already durable; nothing buffered.
        Ok(())
    }
}

/// Extract hits from Arrow batches. Cosine distance becomes a
/// higher-is-better score clamped at zero.
fn extract_hits(batches: &[RecordBatch]) -> Vec<BackendHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let rids = batch
            .column_by_name("rid")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let texts = batch
            .column_by_name("text")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let Some(rids) = rids else { continue };

        for i in 0..batch.num_rows() {
            let score = distances
                .map(|d| (1.0 - d.value(i)).max(0.0))
                .unwrap_or(0.0);
            hits.push(BackendHit {
                rid: rids.value(i).to_string(),
                score,
                text: texts.map(|t| t.value(i).to_string()),
            });
        }
    }
    hits
}
