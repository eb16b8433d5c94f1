#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ragpipe::config::RetrievalSettings;
use ragpipe::{
    ChunkingPolicy, Embedder, Generator, InMemoryDocumentStore, InMemoryVectorIndex,
    IngestPipeline, ModelVersion, Orchestrator, Prompt, QueryLimits, Result,
};
use tokio_util::sync::CancellationToken;

pub const EMBED_MODEL: &str = "keyword-embed";

/// Projects text onto a few keyword axes plus a constant bias.
pub struct KeywordEmbedder {
    model: ModelVersion,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            model: ModelVersion::new(EMBED_MODEL),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let axis = |word: &str| if lower.contains(word) { 1.0 } else { 0.0 };
        vec![axis("sky"), axis("water"), axis("rock"), 0.05]
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_version(&self) -> &ModelVersion {
        &self.model
    }

    fn dimensions(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String], _cancel: &CancellationToken) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

type Reply = dyn Fn(&Prompt) -> Result<String> + Send + Sync;

/// Generator whose reply is computed from the prompt.
pub struct ScriptedGenerator {
    model: ModelVersion,
    reply: Box<Reply>,
    pub prompts: std::sync::Mutex<Vec<Prompt>>,
}

impl ScriptedGenerator {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&Prompt) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            model: ModelVersion::new("scripted-chat"),
            reply: Box::new(reply),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Answers with the sky fact when it is in context.
    pub fn grounded() -> Self {
        Self::new(|prompt| {
            if prompt.user.contains("The sky is blue.") {
                Ok("The sky is blue [^cited].".to_string())
            } else {
                Ok("I could not find that in the knowledge base.".to_string())
            }
        })
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_version(&self) -> &ModelVersion {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &Prompt,
        _model: &ModelVersion,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        (self.reply)(prompt)
    }
}

pub struct Services {
    pub store: Arc<InMemoryDocumentStore>,
    pub index: Arc<InMemoryVectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub ingest: Arc<IngestPipeline>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn services(embedder: Arc<dyn Embedder>, generator: ScriptedGenerator) -> Services {
    let store = Arc::new(InMemoryDocumentStore::new());
    let index = Arc::new(InMemoryVectorIndex::new(QueryLimits::default()));
    let generator = Arc::new(generator);
    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        embedder.clone(),
        index.clone(),
        ChunkingPolicy::new(8, 0).unwrap(),
    ));
    let settings = RetrievalSettings {
        context_budget_tokens: 100_000,
        ..RetrievalSettings::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        embedder.clone(),
        index.clone(),
        generator.clone(),
        settings,
    ));
    Services {
        store,
        index,
        embedder,
        generator,
        ingest,
        orchestrator,
    }
}

pub fn keyword_services(generator: ScriptedGenerator) -> Services {
    services(Arc::new(KeywordEmbedder::new()), generator)
}
