//! Process-local document store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::{build_chunks, not_found, validate_ingest, DocumentStore};
use crate::chunker::ChunkingPolicy;
use crate::error::{RagError, Result};
use crate::model::{Chunk, ChunkId, Document, DocumentId, Metadata};

struct StoredDocument {
    document: Document,
    // Per-document lock so chunking one document never blocks another.
    chunks: Mutex<Option<ChunkSet>>,
}

#[derive(Clone)]
struct ChunkSet {
    policy: ChunkingPolicy,
    chunks: Vec<Chunk>,
}

/// In-memory [`DocumentStore`]; map locks are held only for single inserts/removals.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Arc<StoredDocument>>>,
    chunk_owner: RwLock<HashMap<ChunkId, DocumentId>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn stored(&self, document_id: DocumentId) -> Result<Arc<StoredDocument>> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .ok_or_else(|| not_found(document_id))
    }

    async fn register_chunks(&self, document_id: DocumentId, chunks: &[Chunk]) {
        let mut owners = self.chunk_owner.write().await;
        for chunk in chunks {
            owners.insert(chunk.id, document_id);
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ingest(&self, source_ref: &str, raw_text: &str, metadata: Metadata) -> Result<DocumentId> {
        validate_ingest(source_ref, raw_text)?;
        let document = Document::new(source_ref, raw_text, metadata);
        let id = document.id;
        let stored = Arc::new(StoredDocument {
            document,
            chunks: Mutex::new(None),
        });
        self.documents.write().await.insert(id, stored);
        debug!(document_id = %id, source_ref, "stored document");
        Ok(id)
    }

    async fn chunk(&self, document_id: DocumentId, policy: &ChunkingPolicy) -> Result<Vec<ChunkId>> {
        let stored = self.stored(document_id).await?;
        let mut slot = stored.chunks.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.policy != *policy {
                return Err(RagError::InvalidInput(format!(
                    "document {document_id} is already chunked with a different policy"
                )));
            }
            return Ok(existing.chunks.iter().map(|c| c.id).collect());
        }
        let chunks = build_chunks(document_id, &stored.document.text, policy);
        self.register_chunks(document_id, &chunks).await;
        let ids = chunks.iter().map(|c| c.id).collect();
        *slot = Some(ChunkSet {
            policy: *policy,
            chunks,
        });
        Ok(ids)
    }

    async fn ingest_chunked(
        &self,
        source_ref: &str,
        raw_text: &str,
        metadata: Metadata,
        policy: &ChunkingPolicy,
    ) -> Result<(DocumentId, Vec<ChunkId>)> {
        validate_ingest(source_ref, raw_text)?;
        let document = Document::new(source_ref, raw_text, metadata);
        let id = document.id;
        let chunks = build_chunks(id, &document.text, policy);
        let ids: Vec<ChunkId> = chunks.iter().map(|c| c.id).collect();
        self.register_chunks(id, &chunks).await;
        let stored = Arc::new(StoredDocument {
            document,
            chunks: Mutex::new(Some(ChunkSet {
                policy: *policy,
                chunks,
            })),
        });
        self.documents.write().await.insert(id, stored);
        debug!(document_id = %id, chunks = ids.len(), "stored chunked document");
        Ok((id, ids))
    }

    async fn get(&self, document_id: DocumentId) -> Result<Document> {
        Ok(self.stored(document_id).await?.document.clone())
    }

    async fn chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>> {
        let stored = self.stored(document_id).await?;
        let slot = stored.chunks.lock().await;
        Ok(slot.as_ref().map(|set| set.chunks.clone()).unwrap_or_default())
    }

    async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        let owners: Vec<(ChunkId, DocumentId)> = {
            let map = self.chunk_owner.read().await;
            ids.iter()
                .filter_map(|id| map.get(id).map(|doc| (*id, *doc)))
                .collect()
        };
        let mut out = Vec::with_capacity(owners.len());
        for (chunk_id, document_id) in owners {
            let Ok(stored) = self.stored(document_id).await else {
                continue;
            };
            let slot = stored.chunks.lock().await;
            if let Some(chunk) = slot
                .as_ref()
                .and_then(|set| set.chunks.iter().find(|c| c.id == chunk_id))
            {
                out.push(chunk.clone());
            }
        }
        Ok(out)
    }

    async fn delete(&self, document_id: DocumentId) -> Result<Vec<ChunkId>> {
        let stored = self
            .documents
            .write()
            .await
            .remove(&document_id)
            .ok_or_else(|| not_found(document_id))?;
        let removed: Vec<ChunkId> = {
            let slot = stored.chunks.lock().await;
            slot.as_ref()
                .map(|set| set.chunks.iter().map(|c| c.id).collect())
                .unwrap_or_default()
        };
        let mut owners = self.chunk_owner.write().await;
        for id in &removed {
            owners.remove(id);
        }
        debug!(document_id = %document_id, chunks = removed.len(), "deleted document");
        Ok(removed)
    }

    async fn document_count(&self) -> Result<usize> {
        Ok(self.documents.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy() -> ChunkingPolicy {
        ChunkingPolicy::new(4, 0).unwrap()
    }

    #[tokio::test]
    async fn ingest_then_chunk_round_trips() {
        let store = InMemoryDocumentStore::new();
        let id = store
            .ingest("notice-1", "The sky is blue. Water is wet.", Metadata::new())
            .await
            .unwrap();
        let ids = store.chunk(id, &policy()).await.unwrap();
        assert_eq!(ids.len(), 2);

        let chunks = store.chunks(id).await.unwrap();
        assert_eq!(chunks[0].text, "The sky is blue.");
        assert_eq!(chunks[1].text, "Water is wet.");
        assert!(chunks.iter().all(|c| c.document_id == id));

        // Same policy is idempotent.
        assert_eq!(store.chunk(id, &policy()).await.unwrap(), ids);
    }

    #[tokio::test]
    async fn get_chunk_looks_up_by_id() {
        let store = InMemoryDocumentStore::new();
        let id = store.ingest("notice-2", "Rock is hard.", Metadata::new()).await.unwrap();
        let ids = store.chunk(id, &policy()).await.unwrap();
        let chunk = store.get_chunk(ids[0]).await.unwrap();
        assert_eq!(chunk.text, "Rock is hard.");
        assert_eq!(chunk.document_id, id);

        let err = store.get_chunk(ChunkId::new()).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn different_policy_rejected_after_chunking() {
        let store = InMemoryDocumentStore::new();
        let id = store.ingest("src", "a b c d e", Metadata::new()).await.unwrap();
        store.chunk(id, &policy()).await.unwrap();
        let err = store
            .chunk(id, &ChunkingPolicy::new(2, 0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryDocumentStore::new();
        let missing = DocumentId::new();
        assert!(matches!(store.get(missing).await, Err(RagError::NotFound(_))));
        assert!(matches!(
            store.chunk(missing, &policy()).await,
            Err(RagError::NotFound(_))
        ));
        assert!(matches!(store.delete(missing).await, Err(RagError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_cascades_to_chunks() {
        let store = InMemoryDocumentStore::new();
        let (id, chunk_ids) = store
            .ingest_chunked("src", "one two. three four. five six.", Metadata::new(), &policy())
            .await
            .unwrap();
        let removed = store.delete(id).await.unwrap();
        assert_eq!(removed, chunk_ids);
        assert!(store.chunks_by_ids(&chunk_ids).await.unwrap().is_empty());
        assert_eq!(store.document_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reingesting_source_creates_new_document() {
        let store = InMemoryDocumentStore::new();
        let first = store.ingest("same", "text one", Metadata::new()).await.unwrap();
        let second = store.ingest("same", "text two", Metadata::new()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.document_count().await.unwrap(), 2);
        assert_eq!(store.get(first).await.unwrap().text, "text one");
    }

    #[tokio::test]
    async fn rejects_blank_documents() {
        let store = InMemoryDocumentStore::new();
        assert!(matches!(
            store.ingest("src", "   ", Metadata::new()).await,
            Err(RagError::InvalidInput(_))
        ));
    }
}
