//! Ingestion: store and chunk a document, embed the chunks, index the vectors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, Instrument};

use crate::chunker::ChunkingPolicy;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::model::{Chunk, ChunkId, ChunkRef, Document, DocumentId, Metadata};
use crate::store::DocumentStore;

/// Ids produced by a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// New document.
    pub document_id: DocumentId,
    /// Its chunks, in ordinal order.
    pub chunk_ids: Vec<ChunkId>,
}

/// Coordinates store, embedder and index so a document is searchable or absent, never half-written.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn DocumentStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    policy: ChunkingPolicy,
}

impl IngestPipeline {
    /// Wires the collaborators together.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        policy: ChunkingPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            policy,
        }
    }

    /// Backing document store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Stores, chunks, embeds and indexes `text`.
    ///
    /// The work runs on its own task. When embedding or indexing fails, when
    /// `cancel` fires, or when the returned future is dropped mid-flight, the
    /// document and any vectors already written are removed.
    #[instrument(skip(self, text, metadata, cancel), fields(chars = text.len()))]
    pub async fn ingest(
        &self,
        source_ref: &str,
        text: &str,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let pipeline = self.clone();
        let source_ref = source_ref.to_string();
        let text = text.to_string();
        let cancel = cancel.child_token();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let task = tokio::spawn(
            async move { pipeline.ingest_to_completion(&source_ref, &text, metadata, &cancel).await }
                .in_current_span(),
        );
        task.await
            .map_err(|err| RagError::Storage(format!("ingestion task failed: {err}")))?
    }

    /// Fetches a document and its chunks.
    pub async fn document(&self, document_id: DocumentId) -> Result<(Document, Vec<Chunk>)> {
        let document = self.store.get(document_id).await?;
        let chunks = self.store.chunks(document_id).await?;
        Ok((document, chunks))
    }

    /// Deletes a document, its chunks and their vectors.
    #[instrument(skip(self))]
    pub async fn delete(&self, document_id: DocumentId) -> Result<Vec<ChunkId>> {
        let chunk_ids = self.store.delete(document_id).await?;
        for chunk_id in &chunk_ids {
            self.index.delete_by_chunk(*chunk_id).await?;
        }
        info!(%document_id, chunks = chunk_ids.len(), "document deleted");
        Ok(chunk_ids)
    }

    async fn ingest_to_completion(
        &self,
        source_ref: &str,
        text: &str,
        metadata: Metadata,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let (document_id, chunk_ids) = self
            .store
            .ingest_chunked(source_ref, text, metadata.clone(), &self.policy)
            .await?;
        match self.index_chunks(document_id, &metadata, cancel).await {
            Ok(()) => {
                info!(%document_id, chunks = chunk_ids.len(), "document ingested");
                Ok(IngestReport {
                    document_id,
                    chunk_ids,
                })
            }
            Err(err) => {
                self.roll_back(document_id, &chunk_ids).await;
                Err(err)
            }
        }
    }

    async fn index_chunks(
        &self,
        document_id: DocumentId,
        metadata: &Metadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunks = self.store.chunks(document_id).await?;
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            res = self.embedder.embed_batch(&texts, cancel) => res?,
        };
        let model_version = self.embedder.model_version();
        for (chunk, vector) in chunks.iter().zip(vectors) {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            let chunk_ref = ChunkRef::from(chunk).with_metadata(metadata.clone());
            self.index.upsert(chunk_ref, vector, model_version).await?;
        }
        Ok(())
    }

    async fn roll_back(&self, document_id: DocumentId, chunk_ids: &[ChunkId]) {
        for chunk_id in chunk_ids {
            if let Err(err) = self.index.delete_by_chunk(*chunk_id).await {
                error!(%chunk_id, error = %err, "failed to remove vector during rollback");
            }
        }
        if let Err(err) = self.store.delete(document_id).await {
            error!(%document_id, error = %err, "failed to remove document during rollback");
        }
        info!(%document_id, "ingestion rolled back");
    }
}
