//! Prompt-to-text clients and the streaming completion handle.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};
use crate::model::ModelVersion;
use crate::prompt::Prompt;

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicGenerator;
pub use openai::OpenAiGenerator;

/// Produces completions for composed prompts.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Model used when the caller has no preference.
    fn model_version(&self) -> &ModelVersion;

    /// Returns the full completion for `prompt`.
    async fn generate(
        &self,
        prompt: &Prompt,
        model: &ModelVersion,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Streams the completion as text fragments.
    ///
    /// Providers without incremental output yield the whole completion as one fragment.
    async fn generate_stream(
        &self,
        prompt: &Prompt,
        model: &ModelVersion,
        cancel: &CancellationToken,
    ) -> Result<CompletionStream> {
        let text = self.generate(prompt, model, cancel).await?;
        Ok(CompletionStream::from_text(text, cancel.clone()))
    }
}

/// Finite, cancellable sequence of completion fragments.
///
/// Consuming it is a one-way trip; regenerating needs a fresh call.
/// Cancelling the token ends the stream with [`RagError::Cancelled`].
pub struct CompletionStream {
    inner: BoxStream<'static, Result<String>>,
    cancel: CancellationToken,
}

impl CompletionStream {
    /// Wraps a fragment stream so it stops when `cancel` fires.
    pub fn new<S>(fragments: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<String>> + Send + 'static,
    {
        let token = cancel.clone();
        let tail = stream::once(async move { token.is_cancelled().then_some(Err(RagError::Cancelled)) })
            .filter_map(future::ready);
        let inner = fragments
            .take_until(cancel.clone().cancelled_owned())
            .chain(tail)
            .boxed();
        Self { inner, cancel }
    }

    /// A stream with a single fragment.
    pub fn from_text(text: String, cancel: CancellationToken) -> Self {
        Self::new(stream::once(future::ready(Ok(text))), cancel)
    }

    /// Stops the stream; the next poll yields [`RagError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(fragment) = self.next().await {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}

impl Stream for CompletionStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

pub(crate) fn check_prompt(prompt: &Prompt, max_chars: usize) -> Result<()> {
    if prompt.user.trim().is_empty() {
        return Err(RagError::InvalidInput("prompt is empty".into()));
    }
    let chars = prompt.char_len();
    if chars > max_chars {
        return Err(RagError::InvalidInput(format!(
            "prompt has {chars} characters (limit {max_chars})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_fragments_in_order() {
        let fragments = stream::iter(vec![Ok("The sky ".to_string()), Ok("is blue.".to_string())]);
        let stream = CompletionStream::new(fragments, CancellationToken::new());
        assert_eq!(stream.collect_text().await.unwrap(), "The sky is blue.");
    }

    #[tokio::test]
    async fn cancellation_ends_with_error() {
        let cancel = CancellationToken::new();
        let mut stream = CompletionStream::new(stream::pending(), cancel.clone());
        stream.cancel();
        assert_eq!(stream.next().await, Some(Err(RagError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn stream_is_not_restartable() {
        let mut stream = CompletionStream::from_text("once".into(), CancellationToken::new());
        assert_eq!(stream.next().await, Some(Ok("once".to_string())));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn prompt_limits_are_enforced() {
        let prompt = Prompt::new("system", "question");
        assert!(check_prompt(&prompt, 100).is_ok());
        assert!(matches!(
            check_prompt(&prompt, 5),
            Err(RagError::InvalidInput(_))
        ));
        assert!(check_prompt(&Prompt::new("system", "  "), 100).is_err());
    }
}
