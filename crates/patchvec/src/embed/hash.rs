use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use super::Embedder;

/// Deterministic hashed bag-of-words embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dim` buckets
/// with a sign bit, and the resulting vector is L2-normalised. Identical
/// text always produces identical vectors, across runs and platforms, which
/// makes this the model of choice for tests and model-free deployments.
/// Cosine similarity degrades to token overlap, which is adequate for
/// exercising the retrieval pipeline end to end.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            hasher.write(token.as_bytes());
            let h = hasher.finish();
            let bucket = (h % self.dim as u64) as usize;
            let sign = if h & (1u64 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Embedder for HashEmbedder {
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn fingerprint(&self) -> String {
        format!("hash-{}", self.dim)
    }
}

/// Lowercase alphanumeric tokens, in order.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Parse a `hash-<dim>` model name.
pub fn dimension_from_model(model: &str) -> Option<usize> {
    let dim: usize = model.strip_prefix("hash-")?.parse().ok()?;
    if dim == 0 {
        None
    } else {
        Some(dim)
    }
}
