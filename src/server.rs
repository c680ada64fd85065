//! HTTP surface: `/run`, `/read` and `/health`.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::compiler::TaskCompiler;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::llm::LlmClient;
use crate::sandbox::executor::load_image;
use crate::sandbox::{Fragment, SandboxExecutor, TaskCapabilities, Workspace};

#[derive(Clone)]
pub struct AppState {
    workspace: Arc<Workspace>,
    llm: Arc<dyn LlmClient>,
    compiler: Arc<TaskCompiler>,
    executor: SandboxExecutor,
    max_steps: usize,
}

impl AppState {
    pub fn new(workspace: Arc<Workspace>, llm: Arc<dyn LlmClient>, config: &SandboxConfig) -> Self {
        Self {
            workspace,
            compiler: Arc::new(TaskCompiler::new(Arc::clone(&llm))),
            llm,
            executor: SandboxExecutor::new(config.execution_timeout()),
            max_steps: config.max_steps,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run_task))
        .route("/read", get(read_file))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server terminated with error")
}

// ── Handlers ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RunParams {
    task: String,
    /// Optional image under Root, sent to the model with the task.
    image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunResponse {
    status: String,
    request_id: String,
    steps: usize,
    completed_at: String,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    path: String,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn run_task(
    State(state): State<AppState>,
    Query(params): Query<RunParams>,
) -> Result<Json<RunResponse>> {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("run", request_id = %request_id);

    async move {
        info!("Task received: {}", params.task);

        let image = match params.image.as_deref() {
            Some(path) => Some(load_image(state.workspace.files(), path).await?),
            None => None,
        };
        let source = state.compiler.compile(&params.task, image).await?;
        let fragment = Fragment::parse(&source, state.max_steps)?;

        let capabilities = TaskCapabilities::new(Arc::clone(&state.workspace), Arc::clone(&state.llm));
        let report = state.executor.execute(&fragment, &capabilities).await?;
        for (index, output) in report.outputs.iter().enumerate() {
            let size = output.value.as_ref().map_or(0, String::len);
            debug!("Step {} ({}) produced {size} bytes", index + 1, output.op);
        }
        info!("Task completed: {} steps", report.steps_completed);

        Ok::<_, SandboxError>(Json(RunResponse {
            status: "success".to_string(),
            request_id,
            steps: report.steps_completed,
            completed_at: chrono::Utc::now().to_rfc3339(),
        }))
    }
    .instrument(span)
    .await
}

async fn read_file(
    State(state): State<AppState>,
    Query(params): Query<ReadParams>,
) -> Result<String> {
    state.workspace.files().read_file(&params.path).await
}
