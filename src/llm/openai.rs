//! OpenAI-compatible chat-completions provider.
//!
//! Calls `POST {endpoint}` with a single user message whose content is a
//! list of parts (text, plus an optional `image_url` data URL). Works
//! against OpenAI itself and proxies that mirror its API.
//!
//! Each attempt is bounded by `llm.timeout_secs`; transport errors, 429
//! and 5xx are retried with exponential backoff up to `llm.max_retries`
//! times. Dropping the returned future aborts the call, including any
//! pending backoff sleep.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::LlmConfig;

use super::client::{CompletionRequest, LlmClient, LlmError, LlmResponse};

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// First retry delay; doubles per retry.
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for a single retry delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

// ── Request types ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

// ── Response types ──────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── OpenAiClient ────────────────────────────────────────

/// Client for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiClient {
    client: Client,
    config: LlmConfig,
    retry_initial: Duration,
    retry_max: Duration,
}

impl OpenAiClient {
    /// Fails if the HTTP client cannot be built with the configured
    /// timeouts; there is no untimed fallback.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Http(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            retry_initial: RETRY_INITIAL_DELAY,
            retry_max: RETRY_MAX_DELAY,
        })
    }

    /// Overrides the retry delays (tests use milliseconds).
    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial = initial;
        self.retry_max = max;
        self
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        let mut content = vec![ContentPart::Text {
            text: request.prompt.clone(),
        }];
        if let Some(image) = &request.image {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.data_url(),
                },
            });
        }

        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: self.config.max_tokens,
        }
    }

    async fn send_once(&self, body: &ChatRequest) -> Result<LlmResponse, LlmError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<LlmResponse, LlmError> {
    let parsed: ChatResponse =
        serde_json::from_str(text).map_err(|e| LlmError::Response(e.to_string()))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::Response("missing choices[0].message.content".to_string()))?;

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    Ok(LlmResponse {
        text: content,
        input_tokens,
        output_tokens,
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, LlmError> {
        let body = self.build_request(request);
        let mut backoff = Backoff::new(self.retry_initial, self.retry_max, 2, self.config.max_retries);

        debug!(
            "Calling LLM API ({}) with {} chars{}",
            self.config.model,
            request.prompt.len(),
            if request.image.is_some() { " + image" } else { "" }
        );

        loop {
            match self.send_once(&body).await {
                Ok(response) => {
                    info!(
                        "LLM response: {} in / {} out tokens",
                        response.input_tokens, response.output_tokens
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retriable() => match backoff.next_retry() {
                    Some(delay) => {
                        warn!(
                            "LLM call failed ({e}), retry {} in {}ms",
                            backoff.attempt,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn description(&self) -> String {
        format!("{} ({})", self.config.endpoint, self.config.model)
    }
}
