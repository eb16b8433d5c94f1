#![warn(missing_docs)]
//! Core library entry points for the ragpipe retrieval-augmented answering service.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod generator;
pub mod guard;
pub mod index;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod server;
pub mod store;

#[cfg(test)]
mod test_support;

pub use chunker::ChunkingPolicy;
pub use config::{RagConfig, ServerCli};
pub use embedder::{Embedder, OpenAiEmbedder};
pub use error::{RagError, Result};
pub use generator::{AnthropicGenerator, CompletionStream, Generator, OpenAiGenerator};
pub use guard::{AccessGuard, AccessRequest, AllowAll, Decision, StaticTokenGuard};
pub use index::{InMemoryVectorIndex, PgVectorIndex, QueryLimits, SearchFilter, VectorIndex};
pub use ingest::{IngestPipeline, IngestReport};
pub use model::{
    Chunk, ChunkId, ChunkRef, Document, DocumentId, GeneratedAnswer, Metadata, ModelVersion,
    RetrievalResult, ScoredChunk,
};
pub use orchestrator::{AnswerRequest, Orchestrator, RequestPhase, RequestState};
pub use prompt::{Prompt, NO_CONTEXT_MARKER};
pub use retry::RetryPolicy;
pub use store::{DocumentStore, InMemoryDocumentStore, PgDocumentStore, TableName};
