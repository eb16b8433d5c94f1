//! Per-request state machine: embed the query, retrieve, compose, generate.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RetrievalSettings;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::generator::{CompletionStream, Generator};
use crate::index::{SearchFilter, VectorIndex};
use crate::model::{ChunkId, GeneratedAnswer, ModelVersion, RetrievalResult};
use crate::prompt::{self, ComposedPrompt};

/// Label of a [`RequestState`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Accepted, not yet validated.
    Received,
    /// Embedding the query.
    Embedding,
    /// Searching the vector index.
    Retrieving,
    /// Building the prompt.
    Composing,
    /// Waiting on the generator.
    Generating,
    /// Answer produced.
    Completed,
    /// Stopped with an error.
    Failed,
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Received => "received",
            Self::Embedding => "embedding",
            Self::Retrieving => "retrieving",
            Self::Composing => "composing",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Where a request is, carrying whatever the next step needs.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestState {
    /// Accepted, not yet validated.
    Received,
    /// Query validated; next step embeds it.
    Embedding,
    /// Query embedded.
    Retrieving {
        /// Query vector.
        vector: Vec<f32>,
    },
    /// Hits retrieved (possibly none).
    Composing {
        /// Ranked hits.
        hits: RetrievalResult,
    },
    /// Prompt ready for the generator.
    Generating {
        /// Prompt and its citations.
        composed: ComposedPrompt,
    },
    /// Terminal success.
    Completed(GeneratedAnswer),
    /// Terminal failure.
    Failed {
        /// Phase that was running when the error happened.
        stage: RequestPhase,
        /// What went wrong.
        error: RagError,
    },
}

impl RequestState {
    /// Payload-free label.
    pub fn phase(&self) -> RequestPhase {
        match self {
            Self::Received => RequestPhase::Received,
            Self::Embedding => RequestPhase::Embedding,
            Self::Retrieving { .. } => RequestPhase::Retrieving,
            Self::Composing { .. } => RequestPhase::Composing,
            Self::Generating { .. } => RequestPhase::Generating,
            Self::Completed(_) => RequestPhase::Completed,
            Self::Failed { .. } => RequestPhase::Failed,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed { .. })
    }
}

/// One question in flight, with its transition history.
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    query: String,
    model_version: ModelVersion,
    k: usize,
    filter: SearchFilter,
    cancel: CancellationToken,
    state: RequestState,
    history: Vec<RequestPhase>,
}

impl AnswerRequest {
    /// New request in [`RequestState::Received`].
    pub fn new(query: impl Into<String>, model_version: ModelVersion, k: usize) -> Self {
        Self {
            query: query.into(),
            model_version,
            k,
            filter: SearchFilter::default(),
            cancel: CancellationToken::new(),
            state: RequestState::Received,
            history: vec![RequestPhase::Received],
        }
    }

    /// Ties the request to an external cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Restricts retrieval to chunks matching `filter`.
    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Retrieval filter; empty unless set.
    pub fn filter(&self) -> &SearchFilter {
        &self.filter
    }

    /// The question as asked.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Current state.
    pub fn state(&self) -> &RequestState {
        &self.state
    }

    /// Every phase entered so far, oldest first.
    pub fn history(&self) -> &[RequestPhase] {
        &self.history
    }

    /// Token that aborts the request.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Consumes a terminal request into its outcome.
    pub fn into_answer(self) -> Result<GeneratedAnswer> {
        match self.state {
            RequestState::Completed(answer) => Ok(answer),
            RequestState::Failed { error, .. } => Err(error),
            other => Err(RagError::InvalidInput(format!(
                "request still {}",
                other.phase()
            ))),
        }
    }

    fn enter(&mut self, next: RequestState) {
        self.history.push(next.phase());
        self.state = next;
    }
}

/// Citations plus a live completion stream.
pub struct StreamingAnswer {
    /// Chunk ids placed into the prompt.
    pub citations: Vec<ChunkId>,
    /// Generation model.
    pub model_version: ModelVersion,
    /// Whether the prompt carried the no-context marker.
    pub no_context: bool,
    /// Completion fragments.
    pub completion: CompletionStream,
}

type EmbeddingCache = Mutex<LruCache<(ModelVersion, String), Vec<f32>>>;

/// Drives [`AnswerRequest`]s through embedding, retrieval and generation.
pub struct Orchestrator {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    settings: RetrievalSettings,
    cache: Option<EmbeddingCache>,
}

impl Orchestrator {
    /// Wires the collaborators together.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
        settings: RetrievalSettings,
    ) -> Self {
        let cache = NonZeroUsize::new(settings.embedding_cache_size)
            .map(|capacity| Mutex::new(LruCache::new(capacity)));
        Self {
            embedder,
            index,
            generator,
            settings,
            cache,
        }
    }

    /// Embedding model whose partition is searched by default.
    pub fn model_version(&self) -> &ModelVersion {
        self.embedder.model_version()
    }

    /// `k` used when the caller has none.
    pub fn default_top_k(&self) -> usize {
        self.settings.default_top_k
    }

    /// `k` after clamping to the configured maximum, as the index will apply it.
    pub fn effective_top_k(&self, k: usize) -> usize {
        k.min(self.settings.limits.max_top_k.max(1))
    }

    /// Embeds the query and returns the ranked hits without generating an answer.
    #[instrument(skip(self, request), fields(model = %request.model_version))]
    pub async fn search(&self, mut request: AnswerRequest) -> Result<RetrievalResult> {
        while !request.state.is_terminal() && request.state.phase() != RequestPhase::Composing {
            self.advance(&mut request).await;
        }
        match request.state {
            RequestState::Composing { hits } => {
                info!(hits = hits.len(), "search completed");
                Ok(hits)
            }
            RequestState::Failed { stage, error } => {
                warn!(%stage, kind = error.kind(), %error, "search failed");
                Err(error)
            }
            other => Err(RagError::InvalidInput(format!(
                "request already {}",
                other.phase()
            ))),
        }
    }

    /// One-shot wrapper over [`Orchestrator::run`].
    #[instrument(skip(self, query), fields(model = %model_version))]
    pub async fn answer(&self, query: &str, model_version: &ModelVersion, k: usize) -> Result<GeneratedAnswer> {
        let mut request = AnswerRequest::new(query, model_version.clone(), k);
        self.run(&mut request).await;
        request.into_answer()
    }

    /// Advances until the request is completed or failed.
    pub async fn run(&self, request: &mut AnswerRequest) -> RequestPhase {
        while !request.state.is_terminal() {
            self.advance(request).await;
        }
        let phase = request.state.phase();
        match &request.state {
            RequestState::Completed(answer) => info!(
                citations = answer.citations.len(),
                no_context = answer.no_context,
                "answer completed"
            ),
            RequestState::Failed { stage, error } => {
                warn!(%stage, kind = error.kind(), %error, "answer failed")
            }
            _ => {}
        }
        phase
    }

    /// Performs exactly one transition. Terminal requests are left untouched.
    pub async fn advance(&self, request: &mut AnswerRequest) -> RequestPhase {
        if request.state.is_terminal() {
            return request.state.phase();
        }
        let from = request.state.phase();
        let current = std::mem::replace(&mut request.state, RequestState::Received);
        let next = if request.cancel.is_cancelled() {
            RequestState::Failed {
                stage: from,
                error: RagError::Cancelled,
            }
        } else {
            match self.step(request, current).await {
                Ok(next) => next,
                Err(error) => RequestState::Failed { stage: from, error },
            }
        };
        debug!(%from, to = %next.phase(), "request transition");
        request.enter(next);
        request.state.phase()
    }

    /// Runs embedding, retrieval and composition, then opens a completion stream.
    pub async fn answer_stream(&self, mut request: AnswerRequest) -> Result<StreamingAnswer> {
        while !request.state.is_terminal() && request.state.phase() != RequestPhase::Generating {
            self.advance(&mut request).await;
        }
        let cancel = request.cancel.clone();
        match std::mem::replace(&mut request.state, RequestState::Received) {
            RequestState::Generating { composed } => {
                let model_version = self.generator.model_version().clone();
                let completion = self
                    .generator
                    .generate_stream(&composed.prompt, &model_version, &cancel)
                    .await?;
                info!(citations = composed.citations.len(), "answer stream opened");
                Ok(StreamingAnswer {
                    citations: composed.citations,
                    model_version,
                    no_context: composed.no_context,
                    completion,
                })
            }
            RequestState::Failed { error, .. } => Err(error),
            other => Err(RagError::InvalidInput(format!(
                "request already {}",
                other.phase()
            ))),
        }
    }

    async fn step(&self, request: &AnswerRequest, state: RequestState) -> Result<RequestState> {
        match state {
            RequestState::Received => {
                self.validate(request)?;
                Ok(RequestState::Embedding)
            }
            RequestState::Embedding => {
                let search = self.search_text(request).await?;
                let vector = self
                    .embed_query(&request.model_version, &search, &request.cancel)
                    .await?;
                Ok(RequestState::Retrieving { vector })
            }
            RequestState::Retrieving { vector } => {
                let hits = tokio::select! {
                    biased;
                    _ = request.cancel.cancelled() => return Err(RagError::Cancelled),
                    res = self.index.query_filtered(&vector, &request.model_version, request.k, &request.filter) => {
                        res.map_err(retrieval_error)?
                    }
                };
                debug!(hits = hits.len(), "retrieved chunks");
                Ok(RequestState::Composing { hits })
            }
            RequestState::Composing { hits } => {
                let composed =
                    prompt::compose(&request.query, &hits, self.settings.context_budget_tokens);
                if composed.dropped > 0 {
                    debug!(dropped = composed.dropped, "chunks dropped to fit context budget");
                }
                Ok(RequestState::Generating { composed })
            }
            RequestState::Generating { composed } => {
                let model_version = self.generator.model_version().clone();
                let answer = self
                    .generator
                    .generate(&composed.prompt, &model_version, &request.cancel)
                    .await?;
                Ok(RequestState::Completed(GeneratedAnswer {
                    answer,
                    citations: composed.citations,
                    model_version,
                    no_context: composed.no_context,
                }))
            }
            terminal => Ok(terminal),
        }
    }

    fn validate(&self, request: &AnswerRequest) -> Result<()> {
        if request.query.trim().is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".into()));
        }
        if request.k == 0 {
            return Err(RagError::InvalidInput("k must be a positive integer".into()));
        }
        if &request.model_version != self.embedder.model_version() {
            return Err(RagError::InvalidInput(format!(
                "no embedder configured for model version {}",
                request.model_version
            )));
        }
        Ok(())
    }

    // Rewriting is best effort; anything but cancellation falls back to the original text.
    async fn search_text(&self, request: &AnswerRequest) -> Result<String> {
        if !self.settings.rewrite_query {
            return Ok(request.query.clone());
        }
        let rewrite = prompt::rewrite(&request.query);
        match self
            .generator
            .generate(&rewrite, self.generator.model_version(), &request.cancel)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                debug!(rewritten = %text.trim(), "query rewritten");
                Ok(text.trim().to_string())
            }
            Ok(_) => Ok(request.query.clone()),
            Err(RagError::Cancelled) => Err(RagError::Cancelled),
            Err(err) => {
                warn!(error = %err, "query rewrite failed; using original query");
                Ok(request.query.clone())
            }
        }
    }

    async fn embed_query(
        &self,
        model_version: &ModelVersion,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let key = (model_version.clone(), text.to_string());
        if let Some(cache) = &self.cache {
            if let Some(hit) = {
                let mut guard = cache.lock().await;
                guard.get(&key).cloned()
            } {
                return Ok(hit);
            }
        }
        let vector = self.embedder.embed(text, cancel).await?;
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().await;
            guard.put(key, vector.clone());
        }
        Ok(vector)
    }
}

fn retrieval_error(err: RagError) -> RagError {
    match err {
        RagError::Cancelled | RagError::DimensionMismatch { .. } | RagError::InvalidInput(_) => err,
        other => RagError::RetrievalFailure(other.to_string()),
    }
}
