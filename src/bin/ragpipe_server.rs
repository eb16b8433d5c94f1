use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ragpipe::config::{GenerationProvider, RagConfig};
use ragpipe::generator::{AnthropicGenerator, Generator, OpenAiGenerator};
use ragpipe::index::{InMemoryVectorIndex, PgVectorIndex, VectorIndex};
use ragpipe::server::{self, AppState};
use ragpipe::store::postgres;
use ragpipe::store::schema::{self, SchemaLayout};
use ragpipe::store::{DocumentStore, InMemoryDocumentStore, PgDocumentStore};
use ragpipe::{guard, Embedder, IngestPipeline, OpenAiEmbedder, Orchestrator, ServerCli};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = ServerCli::parse();
    let config = cli.build_config().context("invalid configuration")?;

    let embedder: Arc<dyn Embedder> = Arc::new(
        OpenAiEmbedder::new(config.embedder.clone(), config.retry)
            .context("failed to build embeddings client")?,
    );
    let generator = build_generator(&config)?;
    let (store, index) = build_backends(&config).await?;

    let ingest = Arc::new(IngestPipeline::new(
        store,
        Arc::clone(&embedder),
        Arc::clone(&index),
        config.chunking,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        embedder,
        Arc::clone(&index),
        generator,
        config.retrieval.clone(),
    ));
    let guard = Arc::from(guard::from_settings(&config.guard));
    let state = AppState::new(orchestrator, ingest, index, guard, &config.server);
    let app = server::router(state, &config.server);

    let addr = config.server.bind;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, guarded = !config.guard.tokens.is_empty(), "ragpipe-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;
    Ok(())
}

fn build_generator(config: &RagConfig) -> Result<Arc<dyn Generator>> {
    let generator: Arc<dyn Generator> = match config.generation_provider {
        GenerationProvider::Openai => Arc::new(
            OpenAiGenerator::new(config.generator.clone(), config.retry)
                .context("failed to build OpenAI chat client")?,
        ),
        GenerationProvider::Anthropic => Arc::new(
            AnthropicGenerator::new(config.generator.clone(), config.retry)
                .context("failed to build Anthropic client")?,
        ),
    };
    Ok(generator)
}

async fn build_backends(config: &RagConfig) -> Result<(Arc<dyn DocumentStore>, Arc<dyn VectorIndex>)> {
    let limits = config.retrieval.limits;
    let dims = config.embedder.dimensions;
    let Some(database) = &config.database else {
        info!("no DATABASE_URL configured; using in-memory storage");
        let index = InMemoryVectorIndex::new(limits)
            .with_dimensions(config.embedder.provider.model.clone(), dims);
        return Ok((Arc::new(InMemoryDocumentStore::new()), Arc::new(index)));
    };

    let layout = SchemaLayout::in_schema(&database.schema)?;
    let pool = postgres::connect_pool(&database.url, database.pool_size)
        .context("invalid Postgres configuration")?;
    {
        let client = postgres::checkout(&pool)
            .await
            .context("failed to connect to Postgres")?;
        schema::migrate(&client, &layout, dims, &config.embedder.provider.model)
            .await
            .context("failed to apply schema")?;
    }
    let store = PgDocumentStore::new(pool.clone(), layout.clone());
    let index = PgVectorIndex::new(pool, &layout, dims, limits);
    Ok((Arc::new(store), Arc::new(index)))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
