//! Task compiler: turns a natural-language task into a fragment.
//!
//! The returned text is untrusted. It is only ever handed to
//! `Fragment::parse` and the sandbox executor.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::llm::{CompletionRequest, ImageAttachment, LlmClient};

const PROMPT_TEMPLATE: &str = r#"You are an automation agent working inside a data directory.

Task: {task}

Plan the task as a JSON object of the form {"steps": [...]}. Each step is one of:
  {"op": "read_file", "path": "<relative path>", "save_as": "<name>"}
  {"op": "write_file", "path": "<relative path>", "content": "<text>"}
  {"op": "run_command", "command": "<shell command>", "save_as": "<name>"}
  {"op": "llm_query", "prompt": "<text>", "image_path": "<relative path or null>", "save_as": "<name>"}

"save_as" is optional. A saved value can be used in any later string as {{name}}.
Commands run with the data directory as the working directory.

Rules:
- Use only paths relative to the data directory. Never use absolute paths or "..".
- Never delete files.
- Never access anything outside the data directory.
- Return only the JSON object, with no explanation and no code fence."#;

pub struct TaskCompiler {
    llm: Arc<dyn LlmClient>,
}

impl TaskCompiler {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn build_prompt(task: &str) -> String {
        PROMPT_TEMPLATE.replace("{task}", task.trim())
    }

    /// Asks the model for a fragment. `image`, if given, is sent along
    /// with the prompt so the model can plan around its content.
    pub async fn compile(&self, task: &str, image: Option<ImageAttachment>) -> Result<String> {
        info!("Compiling task ({} chars) via {}", task.len(), self.llm.description());
        let request = CompletionRequest::text(Self::build_prompt(task)).with_image(image);
        let response = self.llm.complete(&request).await?;
        debug!(
            "Compiled fragment: {} chars, tokens in={} out={}",
            response.text.len(),
            response.input_tokens,
            response.output_tokens
        );
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::llm::testing::ScriptedLlm;
    use crate::llm::LlmError;

    #[test]
    fn test_prompt_contains_task_and_rules() {
        let prompt = TaskCompiler::build_prompt("  count the lines in logs/app.log  ");
        assert!(prompt.contains("Task: count the lines in logs/app.log\n"));
        assert!(prompt.contains("Never delete files"));
        assert!(prompt.contains("\"op\": \"read_file\""));
        assert!(prompt.contains("\"op\": \"llm_query\""));
        assert!(!prompt.contains("{task}"));
    }

    #[test]
    fn test_prompt_keeps_placeholder_syntax() {
        let prompt = TaskCompiler::build_prompt("x");
        assert!(prompt.contains("{{name}}"));
    }

    #[tokio::test]
    async fn test_compile_returns_model_text() {
        let llm = Arc::new(ScriptedLlm::new(&[r#"{"steps": []}"#]));
        let compiler = TaskCompiler::new(llm.clone());

        let fragment = compiler.compile("do nothing", None).await.unwrap();

        assert_eq!(fragment, r#"{"steps": []}"#);
        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].prompt.contains("Task: do nothing"));
        assert!(requests[0].image.is_none());
    }

    #[tokio::test]
    async fn test_compile_forwards_image() {
        let llm = Arc::new(ScriptedLlm::new(&["{}"]));
        let compiler = TaskCompiler::new(llm.clone());
        let image = ImageAttachment::from_file("receipt.jpg", vec![0xff, 0xd8]);

        compiler.compile("total the receipt", Some(image.clone())).await.unwrap();

        assert_eq!(llm.requests()[0].image, Some(image));
    }

    #[tokio::test]
    async fn test_compile_failure_is_external_service() {
        let llm = Arc::new(ScriptedLlm::with_results(vec![Err(LlmError::Http(
            "connection refused".into(),
        ))]));
        let compiler = TaskCompiler::new(llm);
        let err = compiler.compile("anything", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::ExternalService(_)));
    }
}
