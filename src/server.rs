//! HTTP surface: ingestion, document lookup/deletion, search and question answering.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerSettings;
use crate::error::RagError;
use crate::guard::{self, AccessGuard, AccessRequest, Decision, PUBLIC_PATHS};
use crate::index::{SearchFilter, VectorIndex};
use crate::ingest::{IngestPipeline, IngestReport};
use crate::model::{Chunk, ChunkId, Document, DocumentId, Metadata, ModelVersion, RetrievalResult};
use crate::orchestrator::{AnswerRequest, Orchestrator};
use crate::store::DocumentStore;

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    ingest: Arc<IngestPipeline>,
    index: Arc<dyn VectorIndex>,
    guard: Arc<dyn AccessGuard>,
    rate_limiter: Option<RateLimiter>,
}

impl AppState {
    /// Bundles the pipeline components with the HTTP-only concerns.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        ingest: Arc<IngestPipeline>,
        index: Arc<dyn VectorIndex>,
        guard: Arc<dyn AccessGuard>,
        settings: &ServerSettings,
    ) -> Self {
        Self {
            orchestrator,
            ingest,
            index,
            guard,
            rate_limiter: RateLimiter::new(settings.max_requests_per_minute, settings.rate_limit_burst),
        }
    }
}

/// Builds the router with guard, rate-limit, trace and CORS layers.
pub fn router(state: AppState, settings: &ServerSettings) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/documents", post(ingest_document))
        .route(
            "/v1/documents/{id}",
            get(get_document).delete(delete_document),
        )
        .route("/v1/search", post(search))
        .route("/v1/query", post(query))
        .route("/v1/query/stream", post(query_stream))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), authorize))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&settings.allowed_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

/// Ingestion request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Where the text came from (file name, URL, notice id).
    pub source_ref: String,
    /// Raw document text.
    pub text: String,
    /// Free-form attributes stored with the document.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Query and search request body.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The question.
    pub query: String,
    /// Hits to retrieve; clamped server-side.
    #[serde(default)]
    pub top_k: Option<usize>,
    /// Embedding model partition to search.
    #[serde(default)]
    pub model_version: Option<String>,
    /// Restricts retrieval to one document or to matching metadata.
    #[serde(default, skip_serializing_if = "SearchFilter::is_empty")]
    pub filter: SearchFilter,
}

/// Ranked hits without a generated answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits, best first.
    pub hits: RetrievalResult,
    /// Request bookkeeping.
    pub meta: SearchMeta,
}

/// Bookkeeping attached to search results.
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchMeta {
    /// Top-k after clamping.
    pub top_k: usize,
    /// Embedding model partition searched.
    pub embedding_model: ModelVersion,
    /// Wall time.
    pub took_ms: u128,
}

/// Answer with citations.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Completion text.
    pub answer: String,
    /// Chunks placed into the prompt, best first.
    pub citations: Vec<ChunkId>,
    /// Request bookkeeping.
    pub meta: QueryMeta,
}

/// Bookkeeping attached to every answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryMeta {
    /// Top-k after clamping.
    pub top_k: usize,
    /// Embedding model partition searched.
    pub embedding_model: ModelVersion,
    /// Generation model.
    pub generation_model: ModelVersion,
    /// True when nothing was retrieved.
    pub no_context: bool,
    /// Wall time.
    pub took_ms: u128,
}

/// First event of a streamed answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Chunks placed into the prompt, best first.
    pub citations: Vec<ChunkId>,
    /// Generation model.
    pub generation_model: ModelVersion,
    /// True when nothing was retrieved.
    pub no_context: bool,
}

/// One streamed completion fragment.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamToken {
    /// Fragment text.
    pub text: String,
}

/// Document with its chunks.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentResponse {
    /// Stored document.
    pub document: Document,
    /// Chunks in ordinal order.
    pub chunks: Vec<Chunk>,
}

/// Result of a delete.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Deleted document.
    pub document_id: DocumentId,
    /// Chunks removed with it.
    pub deleted_chunks: Vec<ChunkId>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    documents: usize,
    embedding_model: ModelVersion,
    vectors: usize,
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable description.
    pub message: String,
    /// Machine-readable error kind.
    pub kind: String,
}

/// Error response with status and optional `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retry_after: Option<Duration>,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "unauthorized",
            message: "missing or invalid bearer token".into(),
            retry_after: None,
        }
    }

    fn too_many_requests() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            kind: "rate_limited",
            message: "rate limit exceeded".into(),
            retry_after: Some(Duration::from_secs(1)),
        }
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        Self {
            status: err.status_code(),
            kind: err.kind(),
            retry_after: err.retry_after(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        RagError::InvalidInput(rejection.body_text()).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, kind = self.kind, message = %self.message, "request failed");
        }
        let body = Json(ErrorBody {
            message: self.message,
            kind: self.kind.to_string(),
        });
        let mut response = (self.status, body).into_response();
        if let Some(delay) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&delay.as_secs().max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

async fn authorize(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let decision = {
        let bearer = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(guard::bearer_token);
        state.guard.authorize(&AccessRequest {
            method: request.method().as_str(),
            path: request.uri().path(),
            bearer,
        })
    };
    match decision {
        Decision::Allowed => next.run(request).await,
        Decision::Denied => {
            warn!(path = %request.uri().path(), "request denied");
            ApiError::unauthorized().into_response()
        }
    }
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !PUBLIC_PATHS.contains(&request.uri().path()) && !limiter.acquire().await {
            return ApiError::too_many_requests().into_response();
        }
    }
    next.run(request).await
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let embedding_model = state.orchestrator.model_version().clone();
    let documents = state.ingest.store().document_count().await?;
    let vectors = state.index.len(&embedding_model).await?;
    Ok(Json(HealthResponse {
        status: "ok",
        documents,
        embedding_model,
        vectors,
    }))
}

async fn ingest_document(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestReport>), ApiError> {
    let Json(request) = payload?;
    let report = state
        .ingest
        .ingest(
            &request.source_ref,
            &request.text,
            request.metadata,
            &CancellationToken::new(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, ApiError> {
    let document_id = parse_document_id(&id)?;
    let (document, chunks) = state.ingest.document(document_id).await?;
    Ok(Json(DocumentResponse { document, chunks }))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let document_id = parse_document_id(&id)?;
    let deleted_chunks = state.ingest.delete(document_id).await?;
    Ok(Json(DeleteResponse {
        document_id,
        deleted_chunks,
    }))
}

async fn search(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Json(request) = payload?;
    let start = Instant::now();
    let (request, top_k, embedding_model) = answer_request(&state, request);
    let hits = state.orchestrator.search(request).await?;
    let took_ms = start.elapsed().as_millis();
    info!(top_k, hits = hits.len(), took_ms, "search answered");
    Ok(Json(SearchResponse {
        hits,
        meta: SearchMeta {
            top_k,
            embedding_model,
            took_ms,
        },
    }))
}

async fn query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = payload?;
    let start = Instant::now();
    let (mut request, top_k, embedding_model) = answer_request(&state, request);
    state.orchestrator.run(&mut request).await;
    let answer = request.into_answer()?;
    let took_ms = start.elapsed().as_millis();
    info!(top_k, citations = answer.citations.len(), took_ms, "query answered");
    Ok(Json(QueryResponse {
        meta: QueryMeta {
            top_k,
            embedding_model,
            generation_model: answer.model_version,
            no_context: answer.no_context,
            took_ms,
        },
        answer: answer.answer,
        citations: answer.citations,
    }))
}

async fn query_stream(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let (request, _, _) = answer_request(&state, request);
    let streaming = state.orchestrator.answer_stream(request).await?;
    let header = Event::default()
        .event("citations")
        .json_data(StreamHeader {
            citations: streaming.citations,
            generation_model: streaming.model_version,
            no_context: streaming.no_context,
        })
        .map_err(|err| RagError::Storage(format!("failed to encode stream header: {err}")))?;

    let body = stream::unfold(Some(streaming.completion), |state| async move {
        let mut completion = state?;
        match completion.next().await {
            Some(Ok(text)) => match Event::default().event("token").json_data(StreamToken { text }) {
                Ok(event) => Some((event, Some(completion))),
                Err(err) => Some((error_event(RagError::Storage(err.to_string())), None)),
            },
            Some(Err(err)) => Some((error_event(err), None)),
            None => Some((Event::default().event("done").data("{}"), None)),
        }
    });
    let events = stream::once(future::ready(header))
        .chain(body)
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn error_event(err: RagError) -> Event {
    let body = ErrorBody {
        message: err.to_string(),
        kind: err.kind().to_string(),
    };
    Event::default()
        .event("error")
        .json_data(&body)
        .unwrap_or_else(|_| Event::default().event("error").data(body.message))
}

fn answer_request(state: &AppState, request: QueryRequest) -> (AnswerRequest, usize, ModelVersion) {
    let requested = request
        .top_k
        .unwrap_or_else(|| state.orchestrator.default_top_k());
    let top_k = state.orchestrator.effective_top_k(requested);
    let model_version = request
        .model_version
        .map(ModelVersion::new)
        .unwrap_or_else(|| state.orchestrator.model_version().clone());
    (
        AnswerRequest::new(request.query, model_version.clone(), top_k).with_filter(request.filter),
        top_k,
        model_version,
    )
}

fn parse_document_id(raw: &str) -> Result<DocumentId, RagError> {
    raw.parse()
        .map_err(|_| RagError::InvalidInput(format!("invalid document id {raw}")))
}

/// Token bucket shared by every handler behind the guard.
#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
