//! Brute-force cosine index held in process memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{check_dims, cosine_similarity, QueryLimits, SearchFilter, VectorIndex};
use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRef, ModelVersion, RetrievalResult, ScoredChunk};

struct Entry {
    chunk: ChunkRef,
    vector: Vec<f32>,
    seq: u64,
}

struct Partition {
    dims: usize,
    entries: HashMap<ChunkId, Entry>,
}

/// [`VectorIndex`] with one lock per model-version partition.
pub struct InMemoryVectorIndex {
    limits: QueryLimits,
    configured_dims: HashMap<ModelVersion, usize>,
    partitions: RwLock<HashMap<ModelVersion, Arc<RwLock<Partition>>>>,
    next_seq: AtomicU64,
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new(QueryLimits::default())
    }
}

impl InMemoryVectorIndex {
    /// Creates an index whose partitions take their dimensionality from the first vector.
    pub fn new(limits: QueryLimits) -> Self {
        Self {
            limits,
            configured_dims: HashMap::new(),
            partitions: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Pins the dimensionality of a model version's partition up front.
    pub fn with_dimensions(mut self, model_version: ModelVersion, dims: usize) -> Self {
        self.configured_dims.insert(model_version, dims);
        self
    }

    async fn partition(&self, model_version: &ModelVersion) -> Option<Arc<RwLock<Partition>>> {
        self.partitions.read().await.get(model_version).cloned()
    }

    async fn partition_or_create(
        &self,
        model_version: &ModelVersion,
        observed_dims: usize,
    ) -> Arc<RwLock<Partition>> {
        if let Some(existing) = self.partition(model_version).await {
            return existing;
        }
        let dims = self
            .configured_dims
            .get(model_version)
            .copied()
            .unwrap_or(observed_dims);
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(model_version.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Partition {
                    dims,
                    entries: HashMap::new(),
                }))
            })
            .clone()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, chunk: ChunkRef, vector: Vec<f32>, model_version: &ModelVersion) -> Result<()> {
        if vector.is_empty() {
            return Err(RagError::InvalidInput("embedding vector is empty".into()));
        }
        let partition = self.partition_or_create(model_version, vector.len()).await;
        let mut guard = partition.write().await;
        check_dims(guard.dims, &vector)?;
        let chunk_id = chunk.chunk_id;
        match guard.entries.get_mut(&chunk_id) {
            Some(entry) => {
                entry.chunk = chunk;
                entry.vector = vector;
            }
            None => {
                let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                guard.entries.insert(chunk_id, Entry { chunk, vector, seq });
            }
        }
        debug!(chunk_id = %chunk_id, %model_version, "upserted vector");
        Ok(())
    }

    #[instrument(skip(self, vector, filter), fields(dims = vector.len()))]
    async fn query_filtered(
        &self,
        vector: &[f32],
        model_version: &ModelVersion,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<RetrievalResult> {
        let k = self.limits.clamp_k(k)?;
        let Some(partition) = self.partition(model_version).await else {
            if let Some(&dims) = self.configured_dims.get(model_version) {
                check_dims(dims, vector)?;
            }
            return Ok(Vec::new());
        };
        let guard = partition.read().await;
        check_dims(guard.dims, vector)?;

        let mut scored: Vec<(f32, u64, &Entry)> = guard
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.chunk))
            .map(|entry| (cosine_similarity(vector, &entry.vector), entry.seq, entry))
            .filter(|(score, _, _)| score.is_finite() && self.limits.admits(*score))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(score, _, entry)| ScoredChunk::new(entry.chunk.clone(), score))
            .collect())
    }

    async fn delete_by_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let partitions: Vec<Arc<RwLock<Partition>>> =
            self.partitions.read().await.values().cloned().collect();
        for partition in partitions {
            partition.write().await.entries.remove(&chunk_id);
        }
        Ok(())
    }

    async fn len(&self, model_version: &ModelVersion) -> Result<usize> {
        match self.partition(model_version).await {
            Some(partition) => Ok(partition.read().await.entries.len()),
            None => Ok(0),
        }
    }
}
