//! Text-to-vector clients.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};
use crate::model::ModelVersion;

pub mod openai;

pub use openai::OpenAiEmbedder;

/// Turns texts into fixed-length vectors for one model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier tagged onto every vector this client produces.
    fn model_version(&self) -> &ModelVersion;

    /// Length of every returned vector.
    fn dimensions(&self) -> usize;

    /// Embeds `texts`, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single text.
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()], cancel).await?;
        vectors
            .pop()
            .ok_or_else(|| RagError::UpstreamFailure("embedder returned no vector".into()))
    }
}
