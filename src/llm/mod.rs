pub mod client;
pub mod openai;

pub use client::{CompletionRequest, ImageAttachment, LlmClient, LlmError, LlmResponse};
pub use openai::OpenAiClient;

#[cfg(test)]
pub mod testing;
