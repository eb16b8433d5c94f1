//! Nearest-neighbour search over chunk embeddings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRef, DocumentId, Metadata, ModelVersion, RetrievalResult};

pub mod memory;
pub mod pgvector;

pub use memory::InMemoryVectorIndex;
pub use pgvector::PgVectorIndex;

/// Default ceiling for `k`.
pub const DEFAULT_MAX_TOP_K: usize = 50;

/// Similarity floor applied by the service unless configured otherwise.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.5;

/// Vector index partitioned by model version.
///
/// Similarity is cosine; ties go to the chunk inserted first. A partition
/// never mixes dimensionalities.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts or replaces the vector for `chunk` under `model_version` (last writer wins).
    async fn upsert(&self, chunk: ChunkRef, vector: Vec<f32>, model_version: &ModelVersion) -> Result<()>;

    /// Returns at most `k` hits from the `model_version` partition, ranked by descending similarity.
    async fn query(&self, vector: &[f32], model_version: &ModelVersion, k: usize) -> Result<RetrievalResult> {
        self.query_filtered(vector, model_version, k, &SearchFilter::default())
            .await
    }

    /// Like [`VectorIndex::query`], considering only chunks that match `filter`.
    async fn query_filtered(
        &self,
        vector: &[f32],
        model_version: &ModelVersion,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<RetrievalResult>;

    /// Removes every vector stored for `chunk_id`, across model versions.
    async fn delete_by_chunk(&self, chunk_id: ChunkId) -> Result<()>;

    /// Number of vectors in a partition.
    async fn len(&self, model_version: &ModelVersion) -> Result<usize>;
}

/// Restricts retrieval to one document, to documents carrying the given metadata, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Only chunks of this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    /// Every pair must be present, with an equal value, in the document metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl SearchFilter {
    /// Filter on a single document.
    pub fn document(document_id: DocumentId) -> Self {
        Self {
            document_id: Some(document_id),
            metadata: Metadata::new(),
        }
    }

    /// Adds a required metadata pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// True when nothing is filtered out.
    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.metadata.is_empty()
    }

    /// Whether `chunk` passes the filter.
    pub fn matches(&self, chunk: &ChunkRef) -> bool {
        self.document_id.map_or(true, |id| id == chunk.document_id)
            && self
                .metadata
                .iter()
                .all(|(key, value)| chunk.metadata.get(key) == Some(value))
    }
}

/// Bounds applied to every query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryLimits {
    /// Requests above this are clamped.
    pub max_top_k: usize,
    /// Hits scoring below this are dropped.
    pub min_similarity: Option<f32>,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_top_k: DEFAULT_MAX_TOP_K,
            min_similarity: None,
        }
    }
}

impl QueryLimits {
    /// Validates `k` and clamps it to the configured maximum.
    pub fn clamp_k(&self, k: usize) -> Result<usize> {
        if k == 0 {
            return Err(RagError::InvalidInput("k must be a positive integer".into()));
        }
        Ok(k.min(self.max_top_k.max(1)))
    }

    /// Whether a hit passes the similarity floor.
    pub fn admits(&self, score: f32) -> bool {
        self.min_similarity.map_or(true, |floor| score >= floor)
    }
}

/// Cosine similarity; zero when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub(crate) fn check_dims(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(RagError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
