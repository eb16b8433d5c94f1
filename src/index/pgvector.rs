//! pgvector-backed index over the `embeddings` table.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use pgvector::Vector;
use tokio_postgres::types::Json;
use tokio_postgres::Row;
use tracing::instrument;

use super::{check_dims, QueryLimits, SearchFilter, VectorIndex};
use crate::error::{RagError, Result};
use crate::model::{ChunkId, ChunkRef, DocumentId, Metadata, ModelVersion, RetrievalResult, ScoredChunk};
use crate::store::postgres::{as_i64, as_usize, checkout};
use crate::store::schema::SchemaLayout;

/// pgvector's default candidate list size.
const MIN_EF_SEARCH: usize = 40;
/// pgvector's upper bound for `hnsw.ef_search`.
const MAX_EF_SEARCH: usize = 1000;

/// [`VectorIndex`] using pgvector's cosine distance operator.
///
/// The vector column is sized at migration time, so every partition in one
/// table shares `dims`. Queries run in a short transaction so search settings
/// apply to that query alone.
pub struct PgVectorIndex {
    pool: Pool,
    dims: usize,
    limits: QueryLimits,
    upsert_sql: String,
    query_sql: String,
    filtered_query_sql: String,
    delete_sql: String,
    count_sql: String,
}

impl PgVectorIndex {
    /// Wraps a connection pool.
    pub fn new(pool: Pool, layout: &SchemaLayout, dims: usize, limits: QueryLimits) -> Self {
        Self {
            pool,
            dims,
            limits,
            upsert_sql: upsert_sql(layout),
            query_sql: select_sql(layout, false),
            filtered_query_sql: select_sql(layout, true),
            delete_sql: format!(
                "DELETE FROM {} WHERE chunk_id = $1",
                layout.embeddings.qualified()
            ),
            count_sql: format!(
                "SELECT COUNT(*) AS total FROM {} WHERE model_version = $1",
                layout.embeddings.qualified()
            ),
        }
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn upsert(&self, chunk: ChunkRef, vector: Vec<f32>, model_version: &ModelVersion) -> Result<()> {
        check_dims(self.dims, &vector)?;
        let embedding = Vector::from(vector);
        let client = checkout(&self.pool).await?;
        client
            .execute(
                self.upsert_sql.as_str(),
                &[&chunk.chunk_id.0, &model_version.as_str(), &embedding],
            )
            .await
            .map_err(|err| {
                RagError::Storage(format!("failed to upsert chunk {}: {err}", chunk.chunk_id))
            })?;
        Ok(())
    }

    #[instrument(skip(self, vector, filter))]
    async fn query_filtered(
        &self,
        vector: &[f32],
        model_version: &ModelVersion,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<RetrievalResult> {
        let k = self.limits.clamp_k(k)?;
        check_dims(self.dims, vector)?;
        let embedding = Vector::from(vector.to_vec());
        let limit = as_i64(k, "k")?;
        let mut client = checkout(&self.pool).await?;
        let tx = client.transaction().await?;
        tx.batch_execute(&search_settings(k, !filter.is_empty())).await?;
        let rows = if filter.is_empty() {
            tx.query(
                self.query_sql.as_str(),
                &[&embedding, &model_version.as_str(), &limit],
            )
            .await?
        } else {
            let document_id = filter.document_id.map(|id| id.0);
            let metadata = Json(&filter.metadata);
            tx.query(
                self.filtered_query_sql.as_str(),
                &[&embedding, &model_version.as_str(), &limit, &document_id, &metadata],
            )
            .await?
        };
        tx.commit().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let hit = scored_from_row(&row)?;
            if hit.score.is_finite() && self.limits.admits(hit.score) {
                out.push(hit);
            }
        }
        Ok(out)
    }

    async fn delete_by_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let client = checkout(&self.pool).await?;
        client
            .execute(self.delete_sql.as_str(), &[&chunk_id.0])
            .await?;
        Ok(())
    }

    async fn len(&self, model_version: &ModelVersion) -> Result<usize> {
        let client = checkout(&self.pool).await?;
        let row = client
            .query_one(self.count_sql.as_str(), &[&model_version.as_str()])
            .await?;
        as_usize(row.get("total"), "total")
    }
}

fn scored_from_row(row: &Row) -> Result<ScoredChunk> {
    let distance: f64 = row.get("distance");
    let Json(metadata): Json<Metadata> = row.get("metadata");
    let chunk = ChunkRef {
        chunk_id: ChunkId(row.get("chunk_id")),
        document_id: DocumentId(row.get("document_id")),
        text: row.get("text"),
        token_count: as_usize(row.get("token_count"), "token_count")?,
        metadata,
    };
    Ok(ScoredChunk::new(chunk, (1.0 - distance) as f32))
}

/// Transaction-local settings for one query.
///
/// The HNSW candidate list must hold at least `k` entries or the index can
/// return fewer hits than asked for. Filtered queries bypass the index, since
/// post-filtering an approximate candidate list can drop qualifying rows.
fn search_settings(k: usize, exact: bool) -> String {
    let ef_search = k.clamp(MIN_EF_SEARCH, MAX_EF_SEARCH);
    let mut sql = format!("SET LOCAL hnsw.ef_search = {ef_search}");
    if exact {
        sql.push_str("; SET LOCAL enable_indexscan = off");
    }
    sql
}

// Re-upserting keeps `seq`, so the original insertion order still breaks ties.
fn upsert_sql(layout: &SchemaLayout) -> String {
    format!(
        "INSERT INTO {} (chunk_id, model_version, embedding) VALUES ($1, $2, $3) \
         ON CONFLICT (chunk_id, model_version) DO UPDATE SET embedding = EXCLUDED.embedding",
        layout.embeddings.qualified()
    )
}

fn select_sql(layout: &SchemaLayout, filtered: bool) -> String {
    let filter = if filtered {
        "AND ($4::uuid IS NULL OR c.document_id = $4) AND d.metadata @> $5::jsonb "
    } else {
        ""
    };
    format!(
        "SELECT \
            e.chunk_id, \
            c.document_id, \
            c.text, \
            c.token_count, \
            d.metadata, \
            e.embedding <=> $1 AS distance \
        FROM {embeddings} e \
        JOIN {chunks} c ON c.id = e.chunk_id \
        JOIN {documents} d ON d.id = c.document_id \
        WHERE e.model_version = $2 {filter}\
        ORDER BY e.embedding <=> $1 ASC, e.seq ASC \
        LIMIT $3",
        embeddings = layout.embeddings.qualified(),
        chunks = layout.chunks.qualified(),
        documents = layout.documents.qualified()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_filters_partition_and_breaks_ties_by_seq() {
        let layout = SchemaLayout::in_schema("public").unwrap();
        let sql = select_sql(&layout, false);
        assert!(sql.contains("WHERE e.model_version = $2 ORDER BY"));
        assert!(sql.contains("ORDER BY e.embedding <=> $1 ASC, e.seq ASC"));
        assert!(!sql.contains("$4"));
    }

    #[test]
    fn filtered_query_binds_document_and_metadata() {
        let layout = SchemaLayout::in_schema("public").unwrap();
        let sql = select_sql(&layout, true);
        assert!(sql.contains("($4::uuid IS NULL OR c.document_id = $4)"));
        assert!(sql.contains("d.metadata @> $5::jsonb ORDER BY"));
        assert!(sql.contains("JOIN \"public\".\"documents\" d ON d.id = c.document_id"));
    }

    #[test]
    fn candidate_list_covers_k() {
        assert_eq!(search_settings(5, false), "SET LOCAL hnsw.ef_search = 40");
        assert_eq!(search_settings(200, false), "SET LOCAL hnsw.ef_search = 200");
        assert_eq!(search_settings(5_000, false), "SET LOCAL hnsw.ef_search = 1000");
        assert!(search_settings(5, true).ends_with("SET LOCAL enable_indexscan = off"));
    }

    #[test]
    fn upsert_is_last_writer_wins() {
        let layout = SchemaLayout::in_schema("public").unwrap();
        let sql = upsert_sql(&layout);
        assert!(sql.contains("ON CONFLICT (chunk_id, model_version) DO UPDATE"));
        assert!(!sql.contains("seq ="));
    }
}
