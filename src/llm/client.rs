//! `LlmClient` trait: abstraction over the model backend.
//!
//! The task compiler and the `llm_query` fragment operation only see
//! this trait, so tests can substitute a scripted client.

use async_trait::async_trait;
use base64::Engine;

use crate::error::SandboxError;

/// A single-turn completion request: one user prompt, optionally with
/// one image.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    pub image: Option<ImageAttachment>,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: Option<ImageAttachment>) -> Self {
        self.image = image;
        self
    }
}

/// Image bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageAttachment {
    /// Builds an attachment, guessing the MIME type from `filename`.
    pub fn from_file(filename: &str, data: Vec<u8>) -> Self {
        Self {
            media_type: mime_from_extension(filename).to_string(),
            data,
        }
    }

    /// `data:` URL with base64 payload.
    pub fn data_url(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&self.data);
        format!("data:{};base64,{encoded}", self.media_type)
    }
}

/// Guesses an image MIME type from a filename extension. Unknown
/// extensions are sent as PNG.
fn mime_from_extension(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

/// LLM response with metadata
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport failure (connect, timeout, broken body).
    #[error("request failed: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// A 2xx whose body does not have the expected shape.
    #[error("unexpected response: {0}")]
    Response(String),
}

impl LlmError {
    /// Transport errors, 429 and 5xx are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            LlmError::Http(_) => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Response(_) => false,
        }
    }
}

impl From<LlmError> for SandboxError {
    fn from(err: LlmError) -> Self {
        SandboxError::ExternalService(err.to_string())
    }
}

/// Abstraction over LLM backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one prompt and returns the model's answer.
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, LlmError>;

    /// Human-readable description of the provider and model.
    fn description(&self) -> String;
}
