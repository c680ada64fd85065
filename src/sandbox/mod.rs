//! Execution boundary around the data directory.
//!
//! The security model is layered:
//!
//! 1. Fragment language: model output is parsed into a closed set of
//!    four operations; anything else fails before execution
//! 2. Path guard: every file path is resolved and must stay under Root
//! 3. Command guard: denylisted tokens reject a command outright
//! 4. Process limits: cwd pinned to Root, scrubbed environment,
//!    deadline, child killed on drop
//!
//! Layer 3 is coarse by nature. Shell commands can still read anything
//! the process user can read; run the service as an unprivileged user
//! inside a container whose only writable mount is Root.

pub mod command;
pub mod executor;
pub mod files;
pub mod fragment;
pub mod path_guard;

use std::path::Path;

use crate::config::SandboxConfig;
use crate::error::Result;

pub use command::{CommandGuard, CommandRunner};
pub use executor::{Capabilities, ExecutionReport, SandboxExecutor, TaskCapabilities};
pub use files::FileAccess;
pub use fragment::Fragment;
pub use path_guard::PathGuard;

/// Root plus the guarded operations over it. Built once at startup and
/// shared read-only by all requests.
#[derive(Debug)]
pub struct Workspace {
    files: FileAccess,
    runner: CommandRunner,
}

impl Workspace {
    /// Creates Root if missing, canonicalizes it, and wires the guards.
    pub fn open(config: &SandboxConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        let guard = PathGuard::new(&config.root)?;

        let runner = CommandRunner::new(
            CommandGuard::new(config.denied_tokens.clone()),
            guard.root(),
            config.command_timeout(),
            config.max_output_bytes,
        );

        Ok(Self {
            files: FileAccess::new(guard),
            runner,
        })
    }

    pub fn root(&self) -> &Path {
        self.files.root()
    }

    pub fn files(&self) -> &FileAccess {
        &self.files
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }
}

/// Sandbox settings rooted at `root`, with the shipped defaults.
#[cfg(test)]
pub fn test_config(root: &Path) -> SandboxConfig {
    SandboxConfig {
        root: root.to_path_buf(),
        denied_tokens: vec!["rm".into(), "del".into(), "unlink".into()],
        command_timeout_secs: 10,
        execution_timeout_secs: 30,
        max_output_bytes: 1024 * 1024,
        max_steps: 64,
    }
}
