//! Postgres identifiers and the idempotent schema migration shared by the store and index.

use tokio_postgres::Client;
use tracing::info;

use crate::error::{RagError, Result};
use crate::model::ModelVersion;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(RagError::InvalidInput("schema name is required".into()));
        }
        if table.trim().is_empty() {
            return Err(RagError::InvalidInput("table name is required".into()));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Returns the raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name for an index on this table, e.g. `public_embeddings_model_idx`.
    pub fn index_name(&self, suffix: &str) -> String {
        format!(
            "{}_{}_{}",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table),
            suffix
        )
    }
}

/// The three tables backing documents, chunks and embeddings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLayout {
    /// Source documents.
    pub documents: TableName,
    /// Chunks, cascading from documents.
    pub chunks: TableName,
    /// Embeddings, cascading from chunks.
    pub embeddings: TableName,
}

impl SchemaLayout {
    /// Standard table names inside `schema`.
    pub fn in_schema(schema: &str) -> Result<Self> {
        Ok(Self {
            documents: TableName::new(schema, "documents")?,
            chunks: TableName::new(schema, "chunks")?,
            embeddings: TableName::new(schema, "embeddings")?,
        })
    }
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(input: &str) -> String {
    format!("'{}'", input.replace('\'', "''"))
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// DDL statements, in order, for a layout whose vector column holds `dims` values.
///
/// The HNSW index is partial on `model_version`, so a nearest-neighbour scan
/// for the active model never walks other models' vectors.
pub fn migration_statements(layout: &SchemaLayout, dims: usize, model_version: &ModelVersion) -> Vec<String> {
    let documents = layout.documents.qualified();
    let chunks = layout.chunks.qualified();
    let embeddings = layout.embeddings.qualified();
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
        format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(layout.documents.schema())
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {documents} (
                id UUID PRIMARY KEY,
                source_ref TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                checksum BIGINT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                chunk_tokens BIGINT,
                overlap_tokens BIGINT,
                max_chunk_chars BIGINT,
                created_at TIMESTAMPTZ NOT NULL
            )"
        ),
        format!("ALTER TABLE {documents} ADD COLUMN IF NOT EXISTS max_chunk_chars BIGINT"),
        format!(
            "CREATE TABLE IF NOT EXISTS {chunks} (
                id UUID PRIMARY KEY,
                document_id UUID NOT NULL REFERENCES {documents}(id) ON DELETE CASCADE,
                ordinal BIGINT NOT NULL,
                text TEXT NOT NULL,
                char_start BIGINT NOT NULL,
                char_end BIGINT NOT NULL,
                token_count BIGINT NOT NULL,
                UNIQUE (document_id, ordinal)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {embeddings} (
                chunk_id UUID NOT NULL REFERENCES {chunks}(id) ON DELETE CASCADE,
                model_version TEXT NOT NULL,
                embedding VECTOR({dims}) NOT NULL,
                seq BIGSERIAL NOT NULL,
                PRIMARY KEY (chunk_id, model_version)
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {chunks} (document_id)",
            layout.chunks.index_name("document_idx")
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {embeddings} USING hnsw (embedding vector_cosine_ops) \
             WHERE model_version = {}",
            hnsw_index_name(layout, model_version),
            quote_literal(model_version.as_str())
        ),
    ]
}

/// One HNSW index per model version; the hash keeps names distinct after sanitizing.
fn hnsw_index_name(layout: &SchemaLayout, model_version: &ModelVersion) -> String {
    let hash = crc32fast::hash(model_version.as_str().as_bytes());
    layout.embeddings.index_name(&format!("hnsw_{hash:08x}"))
}

/// Applies the schema idempotently, indexing vectors of `model_version`.
pub async fn migrate(
    client: &Client,
    layout: &SchemaLayout,
    dims: usize,
    model_version: &ModelVersion,
) -> Result<()> {
    if dims == 0 {
        return Err(RagError::InvalidInput(
            "embedding dimension must be positive".into(),
        ));
    }
    for statement in migration_statements(layout, dims, model_version) {
        client.batch_execute(&statement).await?;
    }
    info!(schema = layout.documents.schema(), dims, %model_version, "schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        let table = TableName::new("public", "we\"ird").unwrap();
        assert_eq!(table.qualified(), "\"public\".\"we\"\"ird\"");
        assert_eq!(table.index_name("idx"), "public_we_ird_idx");
    }

    #[test]
    fn rejects_blank_names() {
        assert!(TableName::new(" ", "chunks").is_err());
        assert!(TableName::new("public", "").is_err());
    }

    #[test]
    fn migration_sizes_vector_column() {
        let layout = SchemaLayout::in_schema("rag").unwrap();
        let model = ModelVersion::new("text-embedding-3-small");
        let ddl = migration_statements(&layout, 1536, &model).join("\n");
        assert!(ddl.contains("VECTOR(1536)"));
        assert!(ddl.contains("ON DELETE CASCADE"));
        assert!(ddl.contains("\"rag\".\"embeddings\""));
        assert!(ddl.contains("ADD COLUMN IF NOT EXISTS max_chunk_chars BIGINT"));
    }

    #[test]
    fn hnsw_index_is_partial_per_model_version() {
        let layout = SchemaLayout::in_schema("rag").unwrap();
        let small = ModelVersion::new("text-embedding-3-small");
        let quoted = ModelVersion::new("o'brien-embed");
        let ddl = migration_statements(&layout, 8, &small);
        let hnsw = ddl.iter().find(|s| s.contains("USING hnsw")).unwrap();
        assert!(hnsw.ends_with("WHERE model_version = 'text-embedding-3-small'"));
        assert_ne!(hnsw_index_name(&layout, &small), hnsw_index_name(&layout, &quoted));
        let escaped = migration_statements(&layout, 8, &quoted).join("\n");
        assert!(escaped.contains("WHERE model_version = 'o''brien-embed'"));
    }
}
