//! Anthropic messages API client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{check_prompt, Generator};
use crate::config::GeneratorSettings;
use crate::error::{classify_status, classify_transport, RagError, Result};
use crate::model::ModelVersion;
use crate::prompt::Prompt;
use crate::retry::RetryPolicy;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for `{base}/messages`. Streaming uses the single-fragment fallback.
#[derive(Clone)]
pub struct AnthropicGenerator {
    client: Client,
    endpoint: String,
    settings: GeneratorSettings,
    retry: RetryPolicy,
}

impl AnthropicGenerator {
    /// Builds a client with the API key and version pinned in default headers.
    pub fn new(settings: GeneratorSettings, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(settings.provider.api_key.trim())
                .map_err(|_| RagError::InvalidInput("invalid Anthropic API key".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::InvalidInput(format!("failed to build HTTP client: {err}")))?;
        let endpoint = settings.provider.endpoint("messages");
        Ok(Self {
            client,
            endpoint,
            settings,
            retry,
        })
    }

    async fn complete_once(&self, body: &MessagesRequest<'_>) -> Result<String> {
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
            return Err(classify_status("Anthropic", status, &text));
        }
        let parsed: MessagesResponse = resp.json().await.map_err(|err| {
            RagError::UpstreamFailure(format!("failed to parse Anthropic response: {err}"))
        })?;
        let answer = parsed
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text),
                ResponseBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if answer.trim().is_empty() {
            return Err(RagError::UpstreamFailure(
                "Anthropic response missing text content".into(),
            ));
        }
        Ok(answer)
    }
}

#[async_trait]
impl Generator for AnthropicGenerator {
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
        let body = MessagesRequest {
            model: model.as_str(),
            max_tokens: self.settings.max_completion_tokens,
            temperature: self.settings.temperature,
            system: &prompt.system,
            messages: vec![Message {
                role: "user",
                content: vec![ContentBlock {
                    kind: "text",
                    text: &prompt.user,
                }],
            }],
        };
        self.retry
            .run("anthropic messages", cancel, || self.complete_once(&body))
            .await
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
struct ContentBlock<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{provider, serve};
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn generator(base: &str) -> AnthropicGenerator {
        let settings = GeneratorSettings::new(provider(base, "claude-3-5-sonnet-latest"));
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        AnthropicGenerator::new(settings, retry).unwrap()
    }

    #[tokio::test]
    async fn joins_text_blocks_and_sends_version_header() {
        let router = Router::new().route(
            "/v1/messages",
            post(|headers: AxumHeaders, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "sk-test");
                assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
                assert_eq!(body["system"], "Use the context.");
                assert_eq!(body["messages"][0]["content"][0]["text"], "Why?");
                Json(json!({
                    "content": [
                        { "type": "text", "text": "Because" },
                        { "type": "tool_use", "id": "t1" },
                        { "type": "text", "text": "physics." }
                    ]
                }))
            }),
        );
        let base = serve(router).await;
        let generator = generator(&base);
        let prompt = Prompt::new("Use the context.", "Why?");
        let cancel = CancellationToken::new();
        let text = generator
            .generate(&prompt, generator.model_version(), &cancel)
            .await
            .unwrap();
        assert_eq!(text, "Because\nphysics.");

        let streamed = generator
            .generate_stream(&prompt, generator.model_version(), &cancel)
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(streamed, text);
    }

    #[tokio::test]
    async fn empty_content_is_an_upstream_failure() {
        let router = Router::new().route(
            "/v1/messages",
            post(|| async { Json(json!({ "content": [] })) }),
        );
        let base = serve(router).await;
        let generator = generator(&base);
        let err = generator
            .generate(
                &Prompt::new("", "Why?"),
                generator.model_version(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::UpstreamFailure(_)));
    }
}
