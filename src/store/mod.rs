//! Relational document/chunk storage.

use async_trait::async_trait;

use crate::chunker::{self, ChunkingPolicy};
use crate::error::{RagError, Result};
use crate::model::{Chunk, ChunkId, Document, DocumentId, Metadata};

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::InMemoryDocumentStore;
pub use postgres::PgDocumentStore;
pub use schema::TableName;

/// Persists documents and their chunks.
///
/// Documents are immutable once stored. Chunking writes every chunk of a
/// document as one unit; a failure leaves no chunks behind.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores a new document and returns its id. Re-ingesting a source creates a new document.
    async fn ingest(&self, source_ref: &str, raw_text: &str, metadata: Metadata) -> Result<DocumentId>;

    /// Splits a stored document into chunks under `policy`.
    ///
    /// Calling this again with the same policy returns the existing chunk ids;
    /// a different policy is rejected since chunks are never rewritten.
    async fn chunk(&self, document_id: DocumentId, policy: &ChunkingPolicy) -> Result<Vec<ChunkId>>;

    /// Stores a document and its chunks in one transactional unit.
    async fn ingest_chunked(
        &self,
        source_ref: &str,
        raw_text: &str,
        metadata: Metadata,
        policy: &ChunkingPolicy,
    ) -> Result<(DocumentId, Vec<ChunkId>)>;

    /// Fetches a document.
    async fn get(&self, document_id: DocumentId) -> Result<Document>;

    /// Chunks of a document ordered by ordinal.
    async fn chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>>;

    /// Fetches chunks by id, preserving the requested order and skipping unknown ids.
    async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>>;

    /// Fetches a single chunk.
    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Chunk> {
        self.chunks_by_ids(&[chunk_id])
            .await?
            .pop()
            .ok_or_else(|| RagError::NotFound(format!("chunk {chunk_id}")))
    }

    /// Deletes a document and its chunks, returning the removed chunk ids.
    async fn delete(&self, document_id: DocumentId) -> Result<Vec<ChunkId>>;

    /// Number of stored documents.
    async fn document_count(&self) -> Result<usize>;
}

pub(crate) fn validate_ingest(source_ref: &str, raw_text: &str) -> Result<()> {
    if source_ref.trim().is_empty() {
        return Err(RagError::InvalidInput("source reference is required".into()));
    }
    if raw_text.trim().is_empty() {
        return Err(RagError::InvalidInput("document text must not be empty".into()));
    }
    Ok(())
}

pub(crate) fn build_chunks(document_id: DocumentId, text: &str, policy: &ChunkingPolicy) -> Vec<Chunk> {
    chunker::split(text, policy)
        .into_iter()
        .map(|span| Chunk {
            id: ChunkId::new(),
            document_id,
            ordinal: span.ordinal,
            text: span.text,
            char_start: span.char_start,
            char_end: span.char_end,
            token_count: span.token_count,
        })
        .collect()
}

pub(crate) fn not_found(document_id: DocumentId) -> RagError {
    RagError::NotFound(format!("document {document_id}"))
}
