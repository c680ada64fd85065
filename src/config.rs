use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Data directory every file and command operation is confined to.
    pub root: PathBuf,
    /// Substrings that make a command string inadmissible.
    #[serde(default = "default_denied_tokens")]
    pub denied_tokens: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Deadline for a whole fragment, all steps included.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-attempt request timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt (transport errors, 429, 5xx).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_denied_tokens() -> Vec<String> {
    ["rm", "del", "unlink"].iter().map(|t| t.to_string()).collect()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_execution_timeout() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_steps() -> usize {
    64
}

fn default_endpoint() -> String {
    "https://api.aiproxy.io/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

impl SandboxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ServerConfig {
    /// `host:port` for the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {path}"))?;
        Self::parse(&content)
    }

    /// Expands environment variables like ${AIPROXY_TOKEN}, then parses and
    /// validates. An unset variable is a configuration error.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)
            .map_err(|e| anyhow::anyhow!("config references {}: {}", e.var_name, e.cause))?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.llm.api_key.trim().is_empty() {
            bail!("llm.api_key is empty (set the token in the environment)");
        }

        let endpoint = url::Url::parse(&self.llm.endpoint)
            .with_context(|| format!("llm.endpoint is not a valid URL: {}", self.llm.endpoint))?;
        if endpoint.scheme() != "https" && endpoint.scheme() != "http" {
            bail!("llm.endpoint must be http(s), got {}://", endpoint.scheme());
        }

        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than zero");
        }
        if self.sandbox.command_timeout_secs == 0 || self.sandbox.execution_timeout_secs == 0 {
            bail!("sandbox timeouts must be greater than zero");
        }
        if self.sandbox.max_steps == 0 {
            bail!("sandbox.max_steps must be greater than zero");
        }
        if self.sandbox.denied_tokens.iter().any(|t| t.is_empty()) {
            bail!("sandbox.denied_tokens must not contain empty entries");
        }
        Ok(())
    }
}
