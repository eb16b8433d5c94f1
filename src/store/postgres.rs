//! Postgres-backed document store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::types::Json;
use tokio_postgres::{NoTls, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::schema::SchemaLayout;
use super::{build_chunks, not_found, validate_ingest, DocumentStore};
use crate::chunker::ChunkingPolicy;
use crate::error::{RagError, Result};
use crate::model::{Chunk, ChunkId, Document, DocumentId, Metadata};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Builds a connection pool; connections are opened lazily on first checkout.
pub fn connect_pool(database_url: &str, max_size: usize) -> Result<Pool> {
    let config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|err| RagError::InvalidInput(format!("invalid Postgres URL: {err}")))?;
    let manager = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    Pool::builder(manager)
        .max_size(max_size.max(1))
        .build()
        .map_err(|err| RagError::Storage(format!("failed to build Postgres pool: {err}")))
}

/// Checks a connection out of `pool`.
pub async fn checkout(pool: &Pool) -> Result<Object> {
    pool.get()
        .await
        .map_err(|err| RagError::Storage(format!("failed to check out a Postgres connection: {err}")))
}

/// [`DocumentStore`] over the `documents` and `chunks` tables.
///
/// Every operation checks out its own pooled connection; writes run in a
/// transaction on that connection, so concurrent ingestions do not queue
/// behind one another.
pub struct PgDocumentStore {
    pool: Pool,
    layout: SchemaLayout,
}

impl PgDocumentStore {
    /// Wraps a connection pool.
    pub fn new(pool: Pool, layout: SchemaLayout) -> Self {
        Self { pool, layout }
    }

    async fn insert_document(
        &self,
        tx: &Transaction<'_>,
        document: &Document,
        policy: Option<&ChunkingPolicy>,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, source_ref, raw_text, checksum, metadata, chunk_tokens, overlap_tokens, max_chunk_chars, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.layout.documents.qualified()
        );
        let columns = policy.map(policy_columns).transpose()?;
        tx.execute(
            &sql,
            &[
                &document.id.0,
                &document.source_ref,
                &document.text,
                &i64::from(document.checksum),
                &Json(&document.metadata),
                &columns.map(|c| c[0]),
                &columns.map(|c| c[1]),
                &columns.map(|c| c[2]),
                &document.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_chunks(&self, tx: &Transaction<'_>, chunks: &[Chunk]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, document_id, ordinal, text, char_start, char_end, token_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.layout.chunks.qualified()
        );
        let statement = tx.prepare(&sql).await?;
        for chunk in chunks {
            tx.execute(
                &statement,
                &[
                    &chunk.id.0,
                    &chunk.document_id.0,
                    &as_i64(chunk.ordinal, "ordinal")?,
                    &chunk.text,
                    &as_i64(chunk.char_start, "char_start")?,
                    &as_i64(chunk.char_end, "char_end")?,
                    &as_i64(chunk.token_count, "token_count")?,
                ],
            )
            .await
            .map_err(|err| {
                RagError::Storage(format!("failed to insert chunk {}: {err}", chunk.ordinal))
            })?;
        }
        Ok(())
    }

    fn chunk_columns() -> &'static str {
        "id, document_id, ordinal, text, char_start, char_end, token_count"
    }
}

/// `chunk_tokens`, `overlap_tokens` and `max_chunk_chars` as stored.
fn policy_columns(policy: &ChunkingPolicy) -> Result<[i64; 3]> {
    Ok([
        as_i64(policy.chunk_tokens, "chunk_tokens")?,
        as_i64(policy.overlap_tokens, "overlap_tokens")?,
        as_i64(policy.max_chunk_chars, "max_chunk_chars")?,
    ])
}

/// Policy recorded on a document row, if it has been chunked.
fn stored_policy(row: &Row) -> Result<Option<ChunkingPolicy>> {
    let chunk_tokens: Option<i64> = row.get("chunk_tokens");
    let overlap_tokens: Option<i64> = row.get("overlap_tokens");
    let max_chunk_chars: Option<i64> = row.get("max_chunk_chars");
    let (Some(size), Some(overlap)) = (chunk_tokens, overlap_tokens) else {
        return Ok(None);
    };
    let policy = ChunkingPolicy::new(as_usize(size, "chunk_tokens")?, as_usize(overlap, "overlap_tokens")?)?;
    match max_chunk_chars {
        Some(chars) => Ok(Some(policy.with_max_chars(as_usize(chars, "max_chunk_chars")?)?)),
        None => Ok(Some(policy)),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn ingest(&self, source_ref: &str, raw_text: &str, metadata: Metadata) -> Result<DocumentId> {
        validate_ingest(source_ref, raw_text)?;
        let document = Document::new(source_ref, raw_text, metadata);
        let mut client = checkout(&self.pool).await?;
        let tx = client.transaction().await?;
        self.insert_document(&tx, &document, None).await?;
        tx.commit().await?;
        debug!(document_id = %document.id, source_ref, "stored document");
        Ok(document.id)
    }

    async fn chunk(&self, document_id: DocumentId, policy: &ChunkingPolicy) -> Result<Vec<ChunkId>> {
        let mut client = checkout(&self.pool).await?;
        let tx = client.transaction().await?;
        let sql = format!(
            "SELECT raw_text, chunk_tokens, overlap_tokens, max_chunk_chars FROM {} WHERE id = $1 FOR UPDATE",
            self.layout.documents.qualified()
        );
        let row = tx
            .query_opt(&sql, &[&document_id.0])
            .await?
            .ok_or_else(|| not_found(document_id))?;
        if let Some(existing) = stored_policy(&row)? {
            if existing != *policy {
                return Err(RagError::InvalidInput(format!(
                    "document {document_id} is already chunked with a different policy"
                )));
            }
            let ids_sql = format!(
                "SELECT id FROM {} WHERE document_id = $1 ORDER BY ordinal",
                self.layout.chunks.qualified()
            );
            let rows = tx.query(&ids_sql, &[&document_id.0]).await?;
            tx.commit().await?;
            return Ok(rows.iter().map(|r| ChunkId(r.get("id"))).collect());
        }

        let raw_text: String = row.get("raw_text");
        let chunks = build_chunks(document_id, &raw_text, policy);
        self.insert_chunks(&tx, &chunks).await?;
        let update = format!(
            "UPDATE {} SET chunk_tokens = $2, overlap_tokens = $3, max_chunk_chars = $4 WHERE id = $1",
            self.layout.documents.qualified()
        );
        let [chunk_tokens, overlap_tokens, max_chunk_chars] = policy_columns(policy)?;
        tx.execute(
            &update,
            &[&document_id.0, &chunk_tokens, &overlap_tokens, &max_chunk_chars],
        )
        .await?;
        tx.commit().await?;
        Ok(chunks.iter().map(|c| c.id).collect())
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
        let chunks = build_chunks(document.id, &document.text, policy);
        let mut client = checkout(&self.pool).await?;
        // Dropping the transaction on any error rolls back the document and its chunks.
        let tx = client.transaction().await?;
        self.insert_document(&tx, &document, Some(policy)).await?;
        self.insert_chunks(&tx, &chunks).await?;
        tx.commit().await?;
        debug!(document_id = %document.id, chunks = chunks.len(), "stored chunked document");
        Ok((document.id, chunks.iter().map(|c| c.id).collect()))
    }

    async fn get(&self, document_id: DocumentId) -> Result<Document> {
        let sql = format!(
            "SELECT id, source_ref, raw_text, checksum, metadata, created_at FROM {} WHERE id = $1",
            self.layout.documents.qualified()
        );
        let client = checkout(&self.pool).await?;
        let row = client
            .query_opt(&sql, &[&document_id.0])
            .await?
            .ok_or_else(|| not_found(document_id))?;
        document_from_row(&row)
    }

    async fn chunks(&self, document_id: DocumentId) -> Result<Vec<Chunk>> {
        let exists_sql = format!(
            "SELECT 1 FROM {} WHERE id = $1",
            self.layout.documents.qualified()
        );
        let client = checkout(&self.pool).await?;
        if client
            .query_opt(&exists_sql, &[&document_id.0])
            .await?
            .is_none()
        {
            return Err(not_found(document_id));
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE document_id = $1 ORDER BY ordinal",
            Self::chunk_columns(),
            self.layout.chunks.qualified()
        );
        let rows = client.query(&sql, &[&document_id.0]).await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn chunks_by_ids(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ANY($1)",
            Self::chunk_columns(),
            self.layout.chunks.qualified()
        );
        let client = checkout(&self.pool).await?;
        let rows = client.query(&sql, &[&raw]).await?;
        let mut by_id: HashMap<ChunkId, Chunk> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(row)?;
            by_id.insert(chunk.id, chunk);
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn delete(&self, document_id: DocumentId) -> Result<Vec<ChunkId>> {
        let mut client = checkout(&self.pool).await?;
        let tx = client.transaction().await?;
        let ids_sql = format!(
            "SELECT id FROM {} WHERE document_id = $1",
            self.layout.chunks.qualified()
        );
        let rows = tx.query(&ids_sql, &[&document_id.0]).await?;
        let delete_sql = format!(
            "DELETE FROM {} WHERE id = $1",
            self.layout.documents.qualified()
        );
        let deleted = tx.execute(&delete_sql, &[&document_id.0]).await?;
        if deleted == 0 {
            return Err(not_found(document_id));
        }
        tx.commit().await?;
        Ok(rows.iter().map(|r| ChunkId(r.get("id"))).collect())
    }

    async fn document_count(&self) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) AS total FROM {}",
            self.layout.documents.qualified()
        );
        let client = checkout(&self.pool).await?;
        let row = client.query_one(&sql, &[]).await?;
        as_usize(row.get::<_, i64>("total"), "total")
    }
}

fn document_from_row(row: &Row) -> Result<Document> {
    let checksum_raw: i64 = row.get("checksum");
    let checksum = u32::try_from(checksum_raw)
        .map_err(|_| RagError::Storage(format!("checksum {checksum_raw} exceeds u32 range")))?;
    let Json(metadata): Json<Metadata> = row.get("metadata");
    let created_at: DateTime<Utc> = row.get("created_at");
    Ok(Document {
        id: DocumentId(row.get("id")),
        source_ref: row.get("source_ref"),
        text: row.get("raw_text"),
        created_at,
        checksum,
        metadata,
    })
}

fn chunk_from_row(row: &Row) -> Result<Chunk> {
    Ok(Chunk {
        id: ChunkId(row.get("id")),
        document_id: DocumentId(row.get("document_id")),
        ordinal: as_usize(row.get("ordinal"), "ordinal")?,
        text: row.get("text"),
        char_start: as_usize(row.get("char_start"), "char_start")?,
        char_end: as_usize(row.get("char_end"), "char_end")?,
        token_count: as_usize(row.get("token_count"), "token_count")?,
    })
}

pub(crate) fn as_i64(value: usize, field: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| RagError::InvalidInput(format!("{field} value {value} exceeds i64 range")))
}

pub(crate) fn as_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RagError::Storage(format!("{field} value {value} is negative")))
}
