//! Explicit configuration objects and the CLI/env surface that builds them.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use url::Url;

use crate::chunker::ChunkingPolicy;
use crate::error::{RagError, Result};
use crate::index::{QueryLimits, DEFAULT_MAX_TOP_K, DEFAULT_MIN_SIMILARITY};
use crate::store::postgres::DEFAULT_POOL_SIZE;
use crate::model::ModelVersion;
use crate::retry::RetryPolicy;

/// Endpoint, credential and model for one provider API.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Bearer credential.
    pub api_key: String,
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: Url,
    /// Model identifier sent with every request.
    pub model: ModelVersion,
}

impl ProviderSettings {
    /// Validates and bundles provider settings.
    pub fn new(api_key: impl Into<String>, base_url: &str, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let model = model.into();
        if api_key.trim().is_empty() {
            return Err(RagError::InvalidInput("missing provider API key".into()));
        }
        if model.trim().is_empty() {
            return Err(RagError::InvalidInput("missing provider model name".into()));
        }
        let base_url = Url::parse(base_url)
            .map_err(|err| RagError::InvalidInput(format!("invalid base URL {base_url}: {err}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(RagError::InvalidInput(format!(
                "base URL {base_url} must be http(s)"
            )));
        }
        Ok(Self {
            api_key,
            base_url,
            model: ModelVersion::new(model),
        })
    }

    /// Joins a path onto the base URL without doubling slashes.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Embedding client limits.
#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    /// Provider endpoint and model.
    pub provider: ProviderSettings,
    /// Expected vector length for the model.
    pub dimensions: usize,
    /// Send `dimensions` in the request body (models that support shortening).
    pub request_dimensions: bool,
    /// Max inputs per HTTP request.
    pub max_batch_inputs: usize,
    /// Max characters summed over one HTTP request.
    pub max_batch_chars: usize,
    /// Absolute per-text limit; longer texts are rejected.
    pub max_input_chars: usize,
    /// Sub-batches in flight at once.
    pub concurrency: usize,
}

impl EmbedderSettings {
    /// Defaults for `text-embedding-3-small`.
    pub fn new(provider: ProviderSettings) -> Self {
        Self {
            provider,
            dimensions: 1536,
            request_dimensions: false,
            max_batch_inputs: 32,
            max_batch_chars: 200_000,
            max_input_chars: 30_000,
            concurrency: 4,
        }
    }
}

/// Which chat API answers questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GenerationProvider {
    /// OpenAI-compatible `/chat/completions`.
    Openai,
    /// Anthropic `/messages`.
    Anthropic,
}

/// Generation client limits.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    /// Provider endpoint and model.
    pub provider: ProviderSettings,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion length cap.
    pub max_completion_tokens: usize,
    /// Absolute prompt size limit in characters.
    pub max_prompt_chars: usize,
}

impl GeneratorSettings {
    /// Defaults matching the chat model the service was tuned with.
    pub fn new(provider: ProviderSettings) -> Self {
        Self {
            provider,
            temperature: 0.7,
            max_completion_tokens: 800,
            max_prompt_chars: 120_000,
        }
    }
}

/// Orchestrator knobs.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// `k` used when a request does not specify one.
    pub default_top_k: usize,
    /// Bounds applied by the vector index.
    pub limits: QueryLimits,
    /// Token budget for the composed prompt.
    pub context_budget_tokens: usize,
    /// Ask the generator to rewrite the query before embedding it.
    pub rewrite_query: bool,
    /// Cached query embeddings (0 disables the cache).
    pub embedding_cache_size: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            default_top_k: 5,
            limits: QueryLimits {
                min_similarity: Some(DEFAULT_MIN_SIMILARITY),
                ..QueryLimits::default()
            },
            context_budget_tokens: 3_000,
            rewrite_query: false,
            embedding_cache_size: 1024,
        }
    }
}

/// Tokens accepted by the access guard.
#[derive(Debug, Clone, Default)]
pub struct GuardSettings {
    /// Accepted bearer tokens; empty disables the guard.
    pub tokens: Vec<String>,
}

/// HTTP-surface knobs.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Listen address.
    pub bind: SocketAddr,
    /// Requests per minute (0 disables rate limiting).
    pub max_requests_per_minute: u32,
    /// Burst size of the rate limiter.
    pub rate_limit_burst: u32,
    /// Origins allowed by CORS; empty allows any.
    pub allowed_origins: Vec<String>,
}

/// Postgres location.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// `postgres://` connection string.
    pub url: String,
    /// Schema holding the tables.
    pub schema: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

/// Everything a running service needs, built once and passed to constructors.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Chunking policy for ingestion.
    pub chunking: ChunkingPolicy,
    /// Embedding client.
    pub embedder: EmbedderSettings,
    /// Generation backend choice.
    pub generation_provider: GenerationProvider,
    /// Generation client.
    pub generator: GeneratorSettings,
    /// Orchestrator behaviour.
    pub retrieval: RetrievalSettings,
    /// Shared retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Access guard.
    pub guard: GuardSettings,
    /// HTTP surface.
    pub server: ServerSettings,
    /// Postgres; `None` runs with in-memory backends.
    pub database: Option<DatabaseSettings>,
}

/// Command-line interface of the server binary; every flag has an env fallback.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ragpipe-server",
    about = "Retrieval-augmented answering over pgvector with OpenAI-compatible providers"
)]
pub struct ServerCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "RAGPIPE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Postgres connection string; omit to run with in-memory storage.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Schema holding the documents/chunks/embeddings tables.
    #[arg(long, env = "RAGPIPE_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Maximum pooled Postgres connections.
    #[arg(long, env = "RAGPIPE_DB_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub db_pool_size: usize,

    /// OpenAI API key used for embeddings (and generation with the openai provider).
    #[arg(long, env = "OPENAI_API_KEY")]
    pub openai_api_key: String,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(long, env = "RAGPIPE_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Embedding model identifier.
    #[arg(long, env = "RAGPIPE_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Embedding dimensionality; sizes the vector column.
    #[arg(long, env = "RAGPIPE_EMBEDDING_DIMENSIONS", default_value_t = 1536)]
    pub embedding_dimensions: usize,

    /// Send the dimensionality to the provider (shortened embeddings).
    #[arg(long, env = "RAGPIPE_EMBEDDING_REQUEST_DIMENSIONS", default_value_t = false)]
    pub request_dimensions: bool,

    /// Max inputs per embedding request.
    #[arg(long, env = "RAGPIPE_EMBEDDING_BATCH", default_value_t = 32)]
    pub embedding_batch: usize,

    /// Max characters per embedding request.
    #[arg(long, env = "RAGPIPE_EMBEDDING_BATCH_CHARS", default_value_t = 200_000)]
    pub embedding_batch_chars: usize,

    /// Concurrent embedding sub-batches.
    #[arg(long, env = "RAGPIPE_EMBEDDING_CONCURRENCY", default_value_t = 4)]
    pub embedding_concurrency: usize,

    /// Generation provider.
    #[arg(long, env = "RAGPIPE_LLM_PROVIDER", value_enum, default_value = "openai")]
    pub llm_provider: GenerationProvider,

    /// Chat model identifier for the openai provider.
    #[arg(long, env = "RAGPIPE_CHAT_MODEL", default_value = "gpt-4o-mini")]
    pub chat_model: String,

    /// Base URL for the chat API; defaults to the embeddings base URL.
    #[arg(long, env = "RAGPIPE_CHAT_BASE")]
    pub chat_base_url: Option<String>,

    /// Anthropic API key (required when --llm-provider anthropic).
    #[arg(long, env = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,

    /// Anthropic model identifier.
    #[arg(long, env = "RAGPIPE_ANTHROPIC_MODEL", default_value = "claude-3-5-sonnet-latest")]
    pub anthropic_model: String,

    /// Sampling temperature for answers.
    #[arg(long, env = "RAGPIPE_TEMPERATURE", default_value_t = 0.7)]
    pub temperature: f32,

    /// Maximum completion tokens.
    #[arg(long, env = "RAGPIPE_MAX_COMPLETION_TOKENS", default_value_t = 800)]
    pub max_completion_tokens: usize,

    /// Tokens per chunk during ingestion.
    #[arg(long, env = "RAGPIPE_CHUNK_TOKENS", default_value_t = 800)]
    pub chunk_tokens: usize,

    /// Overlap between adjacent chunks (tokens).
    #[arg(long, env = "RAGPIPE_CHUNK_OVERLAP", default_value_t = 100)]
    pub chunk_overlap: usize,

    /// Default top-k when the client does not override it.
    #[arg(long, env = "RAGPIPE_DEFAULT_TOP_K", default_value_t = 5)]
    pub default_top_k: usize,

    /// Maximum top-k; larger requests are clamped.
    #[arg(long, env = "RAGPIPE_MAX_TOP_K", default_value_t = DEFAULT_MAX_TOP_K)]
    pub max_top_k: usize,

    /// Drop hits scoring below this cosine similarity; -1 keeps everything.
    #[arg(long, env = "RAGPIPE_MIN_SIMILARITY", default_value_t = DEFAULT_MIN_SIMILARITY, allow_hyphen_values = true)]
    pub min_similarity: f32,

    /// Token budget for the composed prompt.
    #[arg(long, env = "RAGPIPE_CONTEXT_BUDGET", default_value_t = 3_000)]
    pub context_budget_tokens: usize,

    /// Rewrite queries with the chat model before retrieval.
    #[arg(long, env = "RAGPIPE_REWRITE_QUERY", default_value_t = false)]
    pub rewrite_query: bool,

    /// Seconds before a provider call times out.
    #[arg(long, env = "RAGPIPE_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Attempts per provider call, first try included.
    #[arg(long, env = "RAGPIPE_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: usize,

    /// Max cached query embeddings (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    pub embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    pub max_requests_per_minute: u32,

    /// Rate-limit burst size.
    #[arg(long, default_value_t = 12)]
    pub rate_limit_burst: u32,

    /// Accepted bearer tokens, comma separated (empty disables the guard).
    #[arg(long, env = "RAGPIPE_API_TOKENS", default_value = "")]
    pub api_tokens: String,

    /// CORS origins, comma separated (empty allows any).
    #[arg(long, env = "RAGPIPE_ALLOWED_ORIGINS", default_value = "")]
    pub allowed_origins: String,
}

impl ServerCli {
    /// Converts parsed flags into a [`RagConfig`].
    pub fn build_config(&self) -> Result<RagConfig> {
        let bind: SocketAddr = self
            .bind
            .parse()
            .map_err(|err| RagError::InvalidInput(format!("invalid bind address {}: {err}", self.bind)))?;

        let embedding_provider = ProviderSettings::new(
            self.openai_api_key.clone(),
            &self.openai_base_url,
            self.embedding_model.clone(),
        )?;
        let mut embedder = EmbedderSettings::new(embedding_provider);
        embedder.dimensions = self.embedding_dimensions.max(1);
        embedder.request_dimensions = self.request_dimensions;
        embedder.max_batch_inputs = self.embedding_batch.max(1);
        embedder.max_batch_chars = self.embedding_batch_chars.max(1);
        embedder.concurrency = self.embedding_concurrency.max(1);

        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(RagError::InvalidInput(format!(
                "min similarity {} is outside [-1, 1]",
                self.min_similarity
            )));
        }

        let generation_provider = match self.llm_provider {
            GenerationProvider::Openai => ProviderSettings::new(
                self.openai_api_key.clone(),
                self.chat_base_url.as_deref().unwrap_or(&self.openai_base_url),
                self.chat_model.clone(),
            )?,
            GenerationProvider::Anthropic => {
                let key = self.anthropic_api_key.clone().ok_or_else(|| {
                    RagError::InvalidInput(
                        "ANTHROPIC_API_KEY must be set for the Anthropic provider".into(),
                    )
                })?;
                ProviderSettings::new(
                    key,
                    self.chat_base_url
                        .as_deref()
                        .unwrap_or("https://api.anthropic.com/v1"),
                    self.anthropic_model.clone(),
                )?
            }
        };
        let mut generator = GeneratorSettings::new(generation_provider);
        generator.temperature = self.temperature;
        generator.max_completion_tokens = self.max_completion_tokens.max(1);

        let retrieval = RetrievalSettings {
            default_top_k: self.default_top_k.max(1),
            limits: QueryLimits {
                max_top_k: self.max_top_k.max(1),
                min_similarity: Some(self.min_similarity),
            },
            context_budget_tokens: self.context_budget_tokens.max(1),
            rewrite_query: self.rewrite_query,
            embedding_cache_size: self.embedding_cache_size,
        };

        let retry = RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            call_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            ..RetryPolicy::default()
        };

        Ok(RagConfig {
            chunking: ChunkingPolicy::new(self.chunk_tokens, self.chunk_overlap)?
                .with_max_chars(embedder.max_input_chars)?,
            embedder,
            generation_provider: self.llm_provider,
            generator,
            retrieval,
            retry,
            guard: GuardSettings {
                tokens: split_list(&self.api_tokens),
            },
            server: ServerSettings {
                bind,
                max_requests_per_minute: self.max_requests_per_minute,
                rate_limit_burst: self.rate_limit_burst,
                allowed_origins: split_list(&self.allowed_origins),
            },
            database: self.database_url.clone().map(|url| DatabaseSettings {
                url,
                schema: self.schema.clone(),
                pool_size: self.db_pool_size.max(1),
            }),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> ServerCli {
        let mut argv = vec!["ragpipe-server", "--openai-api-key", "sk-test"];
        argv.extend_from_slice(args);
        ServerCli::try_parse_from(argv).expect("parse cli")
    }

    #[test]
    fn defaults_build_in_memory_config() {
        let config = parse(&[]).build_config().unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.chunking, ChunkingPolicy::new(800, 100).unwrap());
        assert_eq!(config.chunking.max_chunk_chars, config.embedder.max_input_chars);
        assert_eq!(config.retrieval.limits.max_top_k, 50);
        assert_eq!(config.retrieval.limits.min_similarity, Some(0.5));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.call_timeout, Duration::from_secs(30));
        assert_eq!(config.embedder.dimensions, 1536);
        assert_eq!(
            config.embedder.provider.endpoint("/embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
        assert!(config.guard.tokens.is_empty());
    }

    #[test]
    fn splits_token_and_origin_lists() {
        let config = parse(&[
            "--api-tokens",
            "alpha, beta,,",
            "--allowed-origins",
            "http://localhost:3000",
        ])
        .build_config()
        .unwrap();
        assert_eq!(config.guard.tokens, vec!["alpha", "beta"]);
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:3000"]);
    }

    #[test]
    fn similarity_floor_is_validated() {
        let config = parse(&["--min-similarity", "-1"]).build_config().unwrap();
        assert_eq!(config.retrieval.limits.min_similarity, Some(-1.0));
        assert!(parse(&["--min-similarity", "1.5"]).build_config().is_err());
        assert!(parse(&["--min-similarity", "NaN"]).build_config().is_err());
    }

    #[test]
    fn pool_size_is_at_least_one() {
        let config = parse(&["--database-url", "postgres://localhost/rag", "--db-pool-size", "0"])
            .build_config()
            .unwrap();
        assert_eq!(config.database.unwrap().pool_size, 1);
    }

    #[test]
    fn anthropic_requires_key() {
        let cli = parse(&["--llm-provider", "anthropic"]);
        assert!(cli.build_config().is_err());
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(ProviderSettings::new("key", "not a url", "model").is_err());
        assert!(ProviderSettings::new("key", "ftp://host", "model").is_err());
        assert!(ProviderSettings::new(" ", "https://host", "model").is_err());
    }
}
