//! Prompt composition under a token budget.

use serde::Serialize;

use crate::chunker::estimate_tokens;
use crate::model::{ChunkId, ScoredChunk};

/// Placed in the context block when retrieval produced nothing usable.
pub const NO_CONTEXT_MARKER: &str = "[NO CONTEXT FOUND]";

const ANSWER_SYSTEM: &str = "You are a precise assistant that answers questions using only the supplied context chunks. \
Cite your sources as [^chunk_id] and never invent references. \
If the context says NO CONTEXT FOUND, say that the knowledge base has no relevant material and answer only if you are certain.";

const ANSWER_INSTRUCTIONS: &str = "Instructions:\n1. Give a direct answer in 1-3 sentences referencing citations.\n2. Add a short bullet list of supporting facts with citations when context exists.\n";

const REWRITE_SYSTEM: &str = "You rewrite user questions into concise search queries for a vector store. \
Remove irrelevant detail and keep every specific term. Reply with the rewritten query only.";

/// System and user message pair sent to a generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    /// Instructions for the model.
    pub system: String,
    /// Context and question.
    pub user: String,
}

impl Prompt {
    /// Bundles the two messages.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Characters across both messages.
    pub fn char_len(&self) -> usize {
        self.system.chars().count() + self.user.chars().count()
    }

    /// Estimated tokens across both messages.
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.system) + estimate_tokens(&self.user)
    }
}

/// A prompt plus the chunks that made it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPrompt {
    /// Messages for the generator.
    pub prompt: Prompt,
    /// Chunk ids included in the context, in rank order.
    pub citations: Vec<ChunkId>,
    /// Retrieved chunks left out to honour the budget.
    pub dropped: usize,
    /// Whether the no-context marker stands in for the context block.
    pub no_context: bool,
}

/// Builds the answer prompt, keeping the highest-ranked chunks that fit `budget_tokens`.
///
/// `chunks` must be ranked best first; the tail is dropped when the prompt
/// would exceed the budget.
pub fn compose(query: &str, chunks: &[ScoredChunk], budget_tokens: usize) -> ComposedPrompt {
    let overhead = estimate_tokens(ANSWER_SYSTEM)
        + estimate_tokens(ANSWER_INSTRUCTIONS)
        + estimate_tokens(query)
        + estimate_tokens(NO_CONTEXT_MARKER)
        + 4;
    let mut remaining = budget_tokens.saturating_sub(overhead);

    let mut context = String::new();
    let mut citations = Vec::new();
    for chunk in chunks {
        let block = render_chunk(chunk);
        let cost = estimate_tokens(&block);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        context.push_str(&block);
        citations.push(chunk.chunk_id);
    }

    let no_context = citations.is_empty();
    if no_context {
        context.push_str(NO_CONTEXT_MARKER);
        context.push('\n');
    }

    let mut user = String::with_capacity(context.len() + query.len() + 64);
    user.push_str("Context:\n");
    user.push_str(&context);
    user.push_str("\nQuestion:\n");
    user.push_str(query.trim());
    user.push_str("\n\n");
    user.push_str(ANSWER_INSTRUCTIONS);

    ComposedPrompt {
        prompt: Prompt::new(ANSWER_SYSTEM, user),
        dropped: chunks.len() - citations.len(),
        citations,
        no_context,
    }
}

/// Prompt asking the generator for a retrieval-friendly rewording of `query`.
pub fn rewrite(query: &str) -> Prompt {
    Prompt::new(REWRITE_SYSTEM, format!("Original query:\n{}", query.trim()))
}

fn render_chunk(chunk: &ScoredChunk) -> String {
    format!(
        "Chunk ID: [^{}]\nDocument: {}\nScore: {:.4}\n{}\n---\n",
        chunk.chunk_id,
        chunk.document_id,
        chunk.score,
        chunk.text.trim()
    )
}
