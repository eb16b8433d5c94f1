//! OpenAI-compatible embeddings client.

use std::ops::Range;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::Embedder;
use crate::config::EmbedderSettings;
use crate::error::{classify_status, classify_transport, RagError, Result};
use crate::model::ModelVersion;
use crate::retry::RetryPolicy;

/// Async embeddings client that talks to `{base}/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    settings: EmbedderSettings,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    /// Builds a client with bearer auth baked into the default headers.
    pub fn new(settings: EmbedderSettings, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", settings.provider.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| RagError::InvalidInput("invalid OpenAI API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::InvalidInput(format!("failed to build HTTP client: {err}")))?;
        let endpoint = settings.provider.endpoint("embeddings");
        Ok(Self {
            client,
            endpoint,
            settings,
            retry,
        })
    }

    fn validate(&self, texts: &[String]) -> Result<()> {
        for (position, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                return Err(RagError::InvalidInput(format!(
                    "embedding input {position} is empty"
                )));
            }
            let chars = text.chars().count();
            if chars > self.settings.max_input_chars {
                return Err(RagError::InvalidInput(format!(
                    "embedding input {position} has {chars} characters (limit {})",
                    self.settings.max_input_chars
                )));
            }
        }
        Ok(())
    }

    async fn send(&self, inputs: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        self.retry
            .run("openai embeddings", cancel, || self.request_once(inputs))
            .await
    }

    async fn request_once(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: self.settings.provider.model.as_str(),
            input: inputs,
            dimensions: self
                .settings
                .request_dimensions
                .then_some(self.settings.dimensions),
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status("OpenAI embeddings", status, &body));
        }
        let mut parsed: EmbeddingResponse = resp.json().await.map_err(|err| {
            RagError::UpstreamFailure(format!("failed to parse OpenAI embedding response: {err}"))
        })?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(RagError::UpstreamFailure(format!(
                "OpenAI returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        let mut vectors = Vec::with_capacity(parsed.data.len());
        for entry in parsed.data {
            if entry.embedding.len() != self.settings.dimensions {
                return Err(RagError::DimensionMismatch {
                    expected: self.settings.dimensions,
                    actual: entry.embedding.len(),
                });
            }
            vectors.push(entry.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_version(&self) -> &ModelVersion {
        &self.settings.provider.model
    }

    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    #[instrument(skip_all, fields(inputs = texts.len(), model = %self.settings.provider.model))]
    async fn embed_batch(&self, texts: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.validate(texts)?;
        let batches = plan_batches(
            texts,
            self.settings.max_batch_inputs,
            self.settings.max_batch_chars,
        );
        debug!(batches = batches.len(), "embedding sub-batches");
        let per_batch: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|range| self.send(&texts[range], cancel))
            .buffered(self.settings.concurrency.max(1))
            .try_collect()
            .await?;
        Ok(per_batch.into_iter().flatten().collect())
    }
}

/// Splits `texts` into contiguous ranges honouring both request ceilings.
fn plan_batches(texts: &[String], max_inputs: usize, max_chars: usize) -> Vec<Range<usize>> {
    let max_inputs = max_inputs.max(1);
    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;
    for (idx, text) in texts.iter().enumerate() {
        let len = text.chars().count();
        let full = idx - start >= max_inputs || (idx > start && chars + len > max_chars);
        if full {
            batches.push(start..idx);
            start = idx;
            chars = 0;
        }
        chars += len;
    }
    if start < texts.len() {
        batches.push(start..texts.len());
    }
    batches
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{provider, serve};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        }
    }

    fn settings(base: &str, dims: usize) -> EmbedderSettings {
        let mut settings = EmbedderSettings::new(provider(base, "text-embedding-3-small"));
        settings.dimensions = dims;
        settings.max_batch_inputs = 2;
        settings.max_input_chars = 64;
        settings
    }

    // Vector = [input length, input position]; entries are returned reversed
    // so the client has to sort by `index`.
    async fn echo_lengths(Json(body): Json<Value>) -> Json<Value> {
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let mut data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let len = text.as_str().unwrap_or_default().len() as f32;
                json!({ "index": index, "embedding": [len, index as f32] })
            })
            .collect();
        data.reverse();
        Json(json!({ "data": data }))
    }

    #[test]
    fn plans_batches_by_inputs_and_chars() {
        let texts: Vec<String> = ["aaaa", "bb", "cccccc", "d", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(plan_batches(&texts, 2, 100), vec![0..2, 2..4, 4..5]);
        assert_eq!(plan_batches(&texts, 10, 6), vec![0..2, 2..3, 3..5]);
        assert_eq!(plan_batches(&texts[..1], 10, 1), vec![0..1]);
    }

    #[tokio::test]
    async fn preserves_input_order_across_sub_batches() {
        let base = serve(Router::new().route("/v1/embeddings", post(echo_lengths))).await;
        let embedder = OpenAiEmbedder::new(settings(&base, 2), fast_retry()).unwrap();
        let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let vectors = embedder
            .embed_batch(&texts, &CancellationToken::new())
            .await
            .unwrap();
        let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test]
    async fn embed_has_stable_dimensionality() {
        let base = serve(Router::new().route("/v1/embeddings", post(echo_lengths))).await;
        let embedder = OpenAiEmbedder::new(settings(&base, 2), fast_retry()).unwrap();
        let cancel = CancellationToken::new();
        for text in ["short", "a somewhat longer input"] {
            let vector = embedder.embed(text, &cancel).await.unwrap();
            assert_eq!(vector.len(), embedder.dimensions());
        }
    }

    #[tokio::test]
    async fn retries_service_unavailable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/v1/embeddings",
                post(|State(calls): State<Arc<AtomicUsize>>, body: Json<Value>| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(StatusCode::SERVICE_UNAVAILABLE);
                    }
                    Ok(echo_lengths(body).await)
                }),
            )
            .with_state(Arc::clone(&calls));
        let base = serve(router).await;
        let embedder = OpenAiEmbedder::new(settings(&base, 2), fast_retry()).unwrap();
        let vector = embedder
            .embed("hello", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(vector, vec![5.0, 0.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/v1/embeddings",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::UNAUTHORIZED
                }),
            )
            .with_state(Arc::clone(&calls));
        let base = serve(router).await;
        let embedder = OpenAiEmbedder::new(settings(&base, 2), fast_retry()).unwrap();
        let err = embedder
            .embed("hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::UpstreamFailure(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_oversized_and_empty_inputs_without_calling() {
        let embedder =
            OpenAiEmbedder::new(settings("http://127.0.0.1:9/v1", 2), fast_retry()).unwrap();
        let cancel = CancellationToken::new();
        let err = embedder.embed(&"x".repeat(65), &cancel).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        let err = embedder.embed("   ", &cancel).await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn wrong_dimensionality_is_reported() {
        let base = serve(Router::new().route("/v1/embeddings", post(echo_lengths))).await;
        let embedder = OpenAiEmbedder::new(settings(&base, 3), fast_retry()).unwrap();
        let err = embedder
            .embed("hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }
}
