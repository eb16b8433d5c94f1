//! OpenAI-compatible chat completions, blocking-style and SSE streaming.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{check_prompt, CompletionStream, Generator};
use crate::config::GeneratorSettings;
use crate::error::{classify_status, classify_transport, RagError, Result};
use crate::model::ModelVersion;
use crate::prompt::Prompt;
use crate::retry::RetryPolicy;

/// Chat client for `{base}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: Client,
    endpoint: String,
    settings: GeneratorSettings,
    retry: RetryPolicy,
}

impl OpenAiGenerator {
    /// Builds a client with bearer auth in the default headers.
    pub fn new(settings: GeneratorSettings, retry: RetryPolicy) -> Result<Self> {
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
        let endpoint = settings.provider.endpoint("chat/completions");
        Ok(Self {
            client,
            endpoint,
            settings,
            retry,
        })
    }

    fn request<'a>(&'a self, prompt: &'a Prompt, model: &'a ModelVersion, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: model.as_str(),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_completion_tokens,
            stream,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
        }
    }

    async fn complete_once(&self, body: &ChatRequest<'_>) -> Result<String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|err| classify_transport(&err))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status("OpenAI chat", status, &text));
        }
        let parsed: ChatResponse = resp.json().await.map_err(|err| {
            RagError::UpstreamFailure(format!("failed to parse OpenAI response: {err}"))
        })?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| RagError::UpstreamFailure("OpenAI response missing text content".into()))
    }

    // Resolves once the provider accepted the stream; only this part is retried.
    async fn open_stream(&self, body: &ChatRequest<'_>) -> Result<EventSource> {
        let mut source = self
            .client
            .post(&self.endpoint)
            .json(body)
            .eventsource()
            .map_err(|err| RagError::InvalidInput(format!("cannot stream request: {err}")))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));
        // EventSource reports Open before any message.
        match source.next().await {
            Some(Ok(_)) => Ok(source),
            Some(Err(err)) => {
                source.close();
                Err(stream_error(err).await)
            }
            None => Err(RagError::TransientUnavailable(
                "OpenAI stream closed before opening".into(),
            )),
        }
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_version(&self) -> &ModelVersion {
        &self.settings.provider.model
    }

    #[instrument(skip_all, fields(model = %model, prompt_chars = prompt.char_len()))]
    async fn generate(
        &self,
        prompt: &Prompt,
        model: &ModelVersion,
        cancel: &CancellationToken,
    ) -> Result<String> {
        check_prompt(prompt, self.settings.max_prompt_chars)?;
        let body = self.request(prompt, model, false);
        self.retry
            .run("openai chat", cancel, || self.complete_once(&body))
            .await
    }

    #[instrument(skip_all, fields(model = %model, prompt_chars = prompt.char_len()))]
    async fn generate_stream(
        &self,
        prompt: &Prompt,
        model: &ModelVersion,
        cancel: &CancellationToken,
    ) -> Result<CompletionStream> {
        check_prompt(prompt, self.settings.max_prompt_chars)?;
        let body = self.request(prompt, model, true);
        let source = self
            .retry
            .run("openai chat stream", cancel, || self.open_stream(&body))
            .await?;
        debug!("completion stream opened");
        // Each wait for the next event gets the per-call time box.
        let idle = self.retry.call_timeout;
        let fragments = stream::unfold(Some(source), move |state| async move {
            let mut source = state?;
            loop {
                let Ok(next) = tokio::time::timeout(idle, source.next()).await else {
                    source.close();
                    let err = RagError::UpstreamFailure(format!(
                        "OpenAI stream stalled for {idle:?}"
                    ));
                    return Some((Err(err), None));
                };
                match next {
                    None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => return None,
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(message))) => {
                        if message.data.trim() == "[DONE]" {
                            source.close();
                            return None;
                        }
                        match parse_delta(&message.data) {
                            Ok(Some(text)) => return Some((Ok(text), Some(source))),
                            Ok(None) => continue,
                            Err(err) => {
                                source.close();
                                return Some((Err(err), None));
                            }
                        }
                    }
                    Some(Err(err)) => {
                        source.close();
                        return Some((Err(stream_error(err).await.into_upstream()), None));
                    }
                }
            }
        });
        Ok(CompletionStream::new(fragments, cancel.clone()))
    }
}

fn parse_delta(data: &str) -> Result<Option<String>> {
    let chunk: ChatChunk = serde_json::from_str(data).map_err(|err| {
        RagError::UpstreamFailure(format!("malformed OpenAI stream chunk: {err}"))
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .find_map(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

async fn stream_error(err: reqwest_eventsource::Error) -> RagError {
    use reqwest_eventsource::Error;
    match err {
        Error::Transport(err) => classify_transport(&err),
        Error::InvalidStatusCode(status, resp) => {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            classify_status("OpenAI chat stream", status, &body)
        }
        other => RagError::UpstreamFailure(format!("OpenAI stream failed: {other}")),
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeneratorSettings;
    use crate::test_support::{provider, serve};
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::response::sse::{Event as SseEvent, Sse};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::convert::Infallible;
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

    fn generator(base: &str) -> OpenAiGenerator {
        let mut settings = GeneratorSettings::new(provider(base, "gpt-4o-mini"));
        settings.max_prompt_chars = 200;
        OpenAiGenerator::new(settings, fast_retry()).unwrap()
    }

    fn prompt() -> Prompt {
        Prompt::new("Answer from context.", "What colour is the sky?")
    }

    async fn chat(headers: AxumHeaders, Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer sk-test")
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "What colour is the sky?");
        assert!(body.get("stream").is_none());
        Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "The sky is blue." } }]
        }))
    }

    #[tokio::test]
    async fn returns_first_choice() {
        let base = serve(Router::new().route("/v1/chat/completions", post(chat))).await;
        let generator = generator(&base);
        let text = generator
            .generate(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "The sky is blue.");
    }

    #[tokio::test]
    async fn empty_content_is_an_upstream_failure() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(json!({ "choices": [{ "message": { "role": "assistant", "content": null } }] }))
            }),
        );
        let base = serve(router).await;
        let generator = generator(&base);
        let err = generator
            .generate(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn retries_rate_limits_then_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/v1/chat/completions",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    StatusCode::TOO_MANY_REQUESTS
                }),
            )
            .with_state(Arc::clone(&calls));
        let base = serve(router).await;
        let generator = generator(&base);
        let err = generator
            .generate(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::UpstreamFailure(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_locally() {
        let generator = generator("http://127.0.0.1:9/v1");
        let big = Prompt::new("system", "x".repeat(500));
        let err = generator
            .generate(&big, generator.model_version(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["stream"], true);
                let events = [
                    json!({ "choices": [{ "delta": { "role": "assistant" } }] }).to_string(),
                    json!({ "choices": [{ "delta": { "content": "The sky " } }] }).to_string(),
                    json!({ "choices": [{ "delta": { "content": "is blue." } }] }).to_string(),
                    "[DONE]".to_string(),
                ];
                Sse::new(stream::iter(
                    events
                        .into_iter()
                        .map(|data| Ok::<_, Infallible>(SseEvent::default().data(data))),
                ))
            }),
        );
        let base = serve(router).await;
        let generator = generator(&base);
        let stream = generator
            .generate_stream(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.collect_text().await.unwrap(), "The sky is blue.");
    }

    #[tokio::test]
    async fn stalled_stream_fails_after_idle_timeout() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let first = json!({ "choices": [{ "delta": { "content": "The sky " } }] }).to_string();
                Sse::new(
                    stream::iter([Ok::<_, Infallible>(SseEvent::default().data(first))])
                        .chain(stream::pending()),
                )
            }),
        );
        let base = serve(router).await;
        let settings = GeneratorSettings::new(provider(&base, "gpt-4o-mini"));
        let retry = RetryPolicy {
            call_timeout: Duration::from_millis(200),
            ..fast_retry()
        };
        let generator = OpenAiGenerator::new(settings, retry).unwrap();
        let mut stream = generator
            .generate_stream(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stream.next().await, Some(Ok("The sky ".to_string())));
        let next = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("stalled stream should time out");
        assert!(matches!(next, Some(Err(RagError::UpstreamFailure(msg))) if msg.contains("stalled")));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn stream_open_failure_is_classified() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { (StatusCode::BAD_REQUEST, "bad model") }),
        );
        let base = serve(router).await;
        let generator = generator(&base);
        let err = generator
            .generate_stream(&prompt(), generator.model_version(), &CancellationToken::new())
            .await
            .err()
            .expect("stream should fail to open");
        assert!(matches!(err, RagError::UpstreamFailure(msg) if msg.contains("bad model")));
    }

    #[test]
    fn delta_parsing_skips_empty_content() {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":"hi"}}]}"#).unwrap(),
            Some("hi".to_string())
        );
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{}}]}"#).unwrap(), None);
        assert_eq!(parse_delta(r#"{"choices":[]}"#).unwrap(), None);
        assert!(parse_delta("not json").is_err());
    }
}
