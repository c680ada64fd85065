//! Sandbox executor: runs a parsed fragment against a capability set.
//!
//! The fragment never touches the filesystem, processes, or the network
//! directly. Each step is dispatched to exactly one method of
//! [`Capabilities`]; that trait is the whole surface a fragment can
//! reach. The first failing step aborts the run and its error is
//! returned as-is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::llm::{CompletionRequest, ImageAttachment, LlmClient};

use super::files::FileAccess;
use super::fragment::{interpolate, Fragment, Step};
use super::Workspace;

/// The operations reachable from inside a fragment.
#[async_trait]
pub trait Capabilities: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn run_command(&self, command: &str) -> Result<String>;

    /// Asks the model a follow-up question, optionally with an image
    /// read from Root.
    async fn llm_query(&self, prompt: &str, image_path: Option<&str>) -> Result<String>;
}

/// Production capability set, built fresh for each request and dropped
/// when the request ends.
pub struct TaskCapabilities {
    workspace: Arc<Workspace>,
    llm: Arc<dyn LlmClient>,
}

impl TaskCapabilities {
    pub fn new(workspace: Arc<Workspace>, llm: Arc<dyn LlmClient>) -> Self {
        Self { workspace, llm }
    }
}

#[async_trait]
impl Capabilities for TaskCapabilities {
    async fn read_file(&self, path: &str) -> Result<String> {
        self.workspace.files().read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.workspace.files().write_file(path, content).await
    }

    async fn run_command(&self, command: &str) -> Result<String> {
        self.workspace.runner().run(command).await
    }

    async fn llm_query(&self, prompt: &str, image_path: Option<&str>) -> Result<String> {
        let image = match image_path {
            Some(path) => Some(load_image(self.workspace.files(), path).await?),
            None => None,
        };
        let request = CompletionRequest::text(prompt).with_image(image);
        let response = self.llm.complete(&request).await?;
        Ok(response.text)
    }
}

/// Reads an image through the path guard.
pub async fn load_image(files: &FileAccess, path: &str) -> Result<ImageAttachment> {
    let data = files.read_bytes(path).await?;
    Ok(ImageAttachment::from_file(path, data))
}

/// Output of one completed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub op: &'static str,
    /// File content, command stdout, or model answer; `None` for writes.
    pub value: Option<String>,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub steps_completed: usize,
    pub outputs: Vec<StepOutput>,
}

#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    timeout: Duration,
}

impl SandboxExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs every step in order under one overall deadline.
    pub async fn execute(
        &self,
        fragment: &Fragment,
        capabilities: &dyn Capabilities,
    ) -> Result<ExecutionReport> {
        info!("Executing fragment with {} steps", fragment.steps.len());
        match tokio::time::timeout(self.timeout, run_steps(fragment, capabilities)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Fragment timed out after {:?}", self.timeout);
                Err(SandboxError::Timeout {
                    what: "fragment",
                    after: self.timeout,
                })
            }
        }
    }
}

async fn run_steps(fragment: &Fragment, capabilities: &dyn Capabilities) -> Result<ExecutionReport> {
    let mut vars: HashMap<String, String> = HashMap::new();
    let mut report = ExecutionReport::default();

    for (index, step) in fragment.steps.iter().enumerate() {
        debug!("Step {}: {}", index + 1, step.op());
        let value = match run_step(step, &vars, capabilities).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Step {} ({}) failed, aborting: {e}", index + 1, step.op());
                return Err(e);
            }
        };

        if let (Some(name), Some(value)) = (step.save_as(), value.as_ref()) {
            vars.insert(name.to_string(), value.clone());
        }
        report.outputs.push(StepOutput {
            op: step.op(),
            value,
        });
        report.steps_completed += 1;
    }

    Ok(report)
}

async fn run_step(
    step: &Step,
    vars: &HashMap<String, String>,
    capabilities: &dyn Capabilities,
) -> Result<Option<String>> {
    match step {
        Step::ReadFile { path, .. } => {
            let path = interpolate(path, vars)?;
            capabilities.read_file(&path).await.map(Some)
        }
        Step::WriteFile { path, content } => {
            let path = interpolate(path, vars)?;
            let content = interpolate(content, vars)?;
            capabilities.write_file(&path, &content).await?;
            Ok(None)
        }
        Step::RunCommand { command, .. } => {
            let command = interpolate(command, vars)?;
            capabilities.run_command(&command).await.map(Some)
        }
        Step::LlmQuery {
            prompt, image_path, ..
        } => {
            let prompt = interpolate(prompt, vars)?;
            let image_path = image_path
                .as_deref()
                .map(|p| interpolate(p, vars))
                .transpose()?;
            capabilities
                .llm_query(&prompt, image_path.as_deref())
                .await
                .map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::llm::testing::ScriptedLlm;
    use crate::sandbox::test_config;

    const MAX_STEPS: usize = 64;

    fn setup(llm: ScriptedLlm) -> (tempfile::TempDir, Arc<Workspace>, Arc<ScriptedLlm>, TaskCapabilities) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Arc::new(Workspace::open(&test_config(dir.path())).unwrap());
        let llm = Arc::new(llm);
        let caps = TaskCapabilities::new(Arc::clone(&workspace), llm.clone());
        (dir, workspace, llm, caps)
    }

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(Duration::from_secs(30))
    }

    fn parse(text: &str) -> Fragment {
        Fragment::parse(text, MAX_STEPS).unwrap()
    }

    /// Records calls; fails on the configured operation.
    struct RecordingCapabilities {
        calls: Mutex<Vec<String>>,
        fail_on: &'static str,
    }

    impl RecordingCapabilities {
        fn new(fail_on: &'static str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            }
        }

        fn record(&self, op: &str, arg: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{op}:{arg}"));
            if op == self.fail_on {
                return Err(SandboxError::CommandExecution {
                    status: Some(1),
                    diagnostic: "scripted failure".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Capabilities for RecordingCapabilities {
        async fn read_file(&self, path: &str) -> Result<String> {
            self.record("read_file", path)?;
            Ok(format!("<{path}>"))
        }

        async fn write_file(&self, path: &str, _content: &str) -> Result<()> {
            self.record("write_file", path)
        }

        async fn run_command(&self, command: &str) -> Result<String> {
            self.record("run_command", command)?;
            Ok(String::new())
        }

        async fn llm_query(&self, prompt: &str, _image_path: Option<&str>) -> Result<String> {
            self.record("llm_query", prompt)?;
            Ok("answer".to_string())
        }
    }

    #[tokio::test]
    async fn test_read_transform_write() {
        let (_dir, workspace, _llm, caps) = setup(ScriptedLlm::new(&[]));
        std::fs::write(workspace.root().join("in.txt"), "alpha").unwrap();

        let fragment = parse(
            r#"{"steps": [
                {"op": "read_file", "path": "in.txt", "save_as": "text"},
                {"op": "write_file", "path": "out/copy.txt", "content": "copy of {{text}}"}
            ]}"#,
        );
        let report = executor().execute(&fragment, &caps).await.unwrap();

        assert_eq!(report.steps_completed, 2);
        assert_eq!(report.outputs[0].value.as_deref(), Some("alpha"));
        assert_eq!(report.outputs[1], StepOutput { op: "write_file", value: None });
        assert_eq!(
            std::fs::read_to_string(workspace.root().join("out/copy.txt")).unwrap(),
            "copy of alpha"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_output_can_be_saved() {
        let (_dir, workspace, _llm, caps) = setup(ScriptedLlm::new(&[]));
        let fragment = parse(
            r#"{"steps": [
                {"op": "run_command", "command": "printf 42", "save_as": "n"},
                {"op": "write_file", "path": "n.txt", "content": "n={{n}}"}
            ]}"#,
        );
        executor().execute(&fragment, &caps).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.root().join("n.txt")).unwrap(),
            "n=42"
        );
    }

    #[tokio::test]
    async fn test_llm_query_with_image() {
        let (_dir, workspace, llm, caps) = setup(ScriptedLlm::new(&["4111 1111 1111 1111"]));
        std::fs::write(workspace.root().join("card.png"), [1u8, 2, 3]).unwrap();

        let fragment = parse(
            r#"{"steps": [
                {"op": "llm_query", "prompt": "Extract the card number", "image_path": "card.png", "save_as": "card"},
                {"op": "write_file", "path": "card.txt", "content": "{{card}}"}
            ]}"#,
        );
        executor().execute(&fragment, &caps).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(workspace.root().join("card.txt")).unwrap(),
            "4111 1111 1111 1111"
        );
        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "Extract the card number");
        let image = requests[0].image.as_ref().unwrap();
        assert_eq!(image.media_type, "image/png");
        assert_eq!(image.data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_llm_query_image_outside_root_is_escape() {
        let (_dir, _workspace, llm, caps) = setup(ScriptedLlm::new(&["never"]));
        let fragment = parse(
            r#"{"steps": [{"op": "llm_query", "prompt": "x", "image_path": "../../etc/shadow"}]}"#,
        );
        let err = executor().execute(&fragment, &caps).await.unwrap_err();
        assert!(matches!(err, SandboxError::PathEscape { .. }));
        assert!(llm.requests().is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_steps() {
        let (_dir, workspace, _llm, caps) = setup(ScriptedLlm::new(&[]));
        std::fs::write(workspace.root().join("keep.txt"), "x").unwrap();

        let fragment = parse(
            r#"{"steps": [
                {"op": "write_file", "path": "a.txt", "content": "a"},
                {"op": "run_command", "command": "rm keep.txt"},
                {"op": "write_file", "path": "b.txt", "content": "b"}
            ]}"#,
        );
        let err = executor().execute(&fragment, &caps).await.unwrap_err();

        assert!(matches!(err, SandboxError::Rejected { .. }));
        assert!(workspace.root().join("a.txt").exists());
        assert!(workspace.root().join("keep.txt").exists());
        assert!(!workspace.root().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_failure_error_is_propagated_unchanged() {
        let caps = RecordingCapabilities::new("run_command");
        let fragment = parse(
            r#"{"steps": [
                {"op": "read_file", "path": "a"},
                {"op": "run_command", "command": "make"},
                {"op": "llm_query", "prompt": "never asked"}
            ]}"#,
        );
        let err = executor().execute(&fragment, &caps).await.unwrap_err();
        assert!(matches!(err, SandboxError::CommandExecution { status: Some(1), .. }));
        assert_eq!(
            *caps.calls.lock().unwrap(),
            vec!["read_file:a".to_string(), "run_command:make".to_string()]
        );
    }

    #[tokio::test]
    async fn test_absolute_and_traversal_paths_are_escapes() {
        let (_dir, _workspace, _llm, caps) = setup(ScriptedLlm::new(&[]));
        for path in ["/etc/passwd", "../outside.txt", "..\\\\..\\\\secrets"] {
            let text = format!(r#"{{"steps": [{{"op": "read_file", "path": "{path}"}}]}}"#);
            let err = executor().execute(&parse(&text), &caps).await.unwrap_err();
            assert!(
                matches!(err, SandboxError::PathEscape { .. }),
                "expected escape for {path}, got {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_undefined_variable_fails_step() {
        let caps = RecordingCapabilities::new("");
        let fragment = parse(
            r#"{"steps": [{"op": "write_file", "path": "x.txt", "content": "{{nope}}"}]}"#,
        );
        let err = executor().execute(&fragment, &caps).await.unwrap_err();
        assert!(matches!(err, SandboxError::SandboxExecution(_)));
        assert!(caps.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outside_capability_never_executes() {
        let caps = RecordingCapabilities::new("");
        let result = Fragment::parse(
            r#"{"steps": [
                {"op": "write_file", "path": "a.txt", "content": "a"},
                {"op": "exec", "program": "/bin/sh", "args": ["-c", "id"]}
            ]}"#,
            MAX_STEPS,
        );
        assert!(matches!(result, Err(SandboxError::SandboxExecution(_))));
        // Nothing ran, not even the valid first step
        assert!(caps.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fragment_succeeds() {
        let caps = RecordingCapabilities::new("");
        let report = executor().execute(&parse("{}"), &caps).await.unwrap();
        assert_eq!(report.steps_completed, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fragment_deadline() {
        let (_dir, _workspace, _llm, caps) = setup(ScriptedLlm::new(&[]));
        let fragment = parse(r#"{"steps": [{"op": "run_command", "command": "sleep 5"}]}"#);
        let executor = SandboxExecutor::new(Duration::from_millis(200));
        let err = executor.execute(&fragment, &caps).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout { what: "fragment", .. }));
    }

    #[tokio::test]
    async fn test_llm_failure_is_external_service_error() {
        let (_dir, _workspace, _llm, caps) = setup(ScriptedLlm::with_results(vec![Err(
            crate::llm::LlmError::Status {
                status: 500,
                body: "down".to_string(),
            },
        )]));
        let fragment = parse(r#"{"steps": [{"op": "llm_query", "prompt": "hi"}]}"#);
        let err = executor().execute(&fragment, &caps).await.unwrap_err();
        assert!(matches!(err, SandboxError::ExternalService(_)));
    }
}
