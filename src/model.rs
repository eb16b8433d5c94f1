//! Shared records passed between the store, index and orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Allocates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a stored document.
    DocumentId
);
uuid_id!(
    /// Identifier of a chunk carved out of a document.
    ChunkId
);

/// Identifier tying a vector or completion to the model that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(String);

impl ModelVersion {
    /// Wraps a provider model identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Free-form string metadata stored alongside a document.
pub type Metadata = BTreeMap<String, String>;

/// Source document as ingested. Never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Store-assigned identifier.
    pub id: DocumentId,
    /// Caller-supplied origin (URL, file path, notice id...).
    pub source_ref: String,
    /// Raw document text.
    pub text: String,
    /// Ingestion timestamp.
    pub created_at: DateTime<Utc>,
    /// CRC32 of the raw text.
    pub checksum: u32,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    /// Builds a new document, assigning an id, timestamp and checksum.
    pub fn new(source_ref: impl Into<String>, text: impl Into<String>, metadata: Metadata) -> Self {
        let text = text.into();
        Self {
            id: DocumentId::new(),
            source_ref: source_ref.into(),
            checksum: checksum(&text),
            text,
            created_at: Utc::now(),
            metadata,
        }
    }
}

/// CRC32 of a text body.
pub fn checksum(text: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(text.as_bytes());
    hasher.finalize()
}

/// Bounded span of a document's text, embedded and retrieved independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk identifier.
    pub id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Zero-based position within the document.
    pub ordinal: usize,
    /// Chunk text.
    pub text: String,
    /// Byte offset of the first character within the document text.
    pub char_start: usize,
    /// Exclusive byte end offset within the document text.
    pub char_end: usize,
    /// Whitespace token count.
    pub token_count: usize,
}

/// Reference stored next to a vector so query results can be rendered without a store lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Chunk text.
    pub text: String,
    /// Whitespace token count.
    pub token_count: usize,
    /// Metadata of the owning document, used for filtered retrieval.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ChunkRef {
    /// Replaces the attached document metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl From<&Chunk> for ChunkRef {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id,
            document_id: chunk.document_id,
            text: chunk.text.clone(),
            token_count: chunk.token_count,
            metadata: Metadata::new(),
        }
    }
}

/// One retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Owning document.
    pub document_id: DocumentId,
    /// Chunk text.
    pub text: String,
    /// Whitespace token count.
    pub token_count: usize,
    /// Metadata of the owning document.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
}

impl ScoredChunk {
    /// Attaches a score to a chunk reference.
    pub fn new(chunk: ChunkRef, score: f32) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            text: chunk.text,
            token_count: chunk.token_count,
            metadata: chunk.metadata,
            score,
        }
    }
}

/// Hits ranked by descending similarity, bounded to the requested top-K.
pub type RetrievalResult = Vec<ScoredChunk>;

/// Final output of the retrieval orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    /// Completion text.
    pub answer: String,
    /// Chunks whose text was placed into the prompt, in rank order.
    pub citations: Vec<ChunkId>,
    /// Generation model that produced the answer.
    pub model_version: ModelVersion,
    /// True when retrieval produced nothing and the prompt carried the no-context marker.
    pub no_context: bool,
}
