//! Shell command admission and execution.
//!
//! `CommandGuard` is a coarse substring filter: it over-rejects (a file
//! named `model.txt` contains "del") and under-rejects (an interpreter
//! one-liner can still delete). It is a last line, not a boundary; the
//! runner adds the real limits: cwd pinned to Root, scrubbed environment,
//! a deadline, and the command's whole process group killed when `run`
//! returns or is cancelled.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};

/// Environment variables passed through to commands. Everything else,
/// including the model API token, is dropped.
const SAFE_ENV_VARS: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ"];

/// Fallback PATH when the host has none.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone)]
pub struct CommandGuard {
    denied_tokens: Vec<String>,
}

impl CommandGuard {
    pub fn new(denied_tokens: Vec<String>) -> Self {
        Self { denied_tokens }
    }

    /// Rejects `command` if any denied token occurs anywhere in it.
    pub fn check(&self, command: &str) -> Result<()> {
        match self
            .denied_tokens
            .iter()
            .find(|token| command.contains(token.as_str()))
        {
            Some(token) => {
                warn!("Command rejected (token '{token}'): {command}");
                Err(SandboxError::Rejected {
                    token: token.clone(),
                })
            }
            None => Ok(()),
        }
    }
}

/// Runs vetted commands through `sh -c` inside Root.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    guard: CommandGuard,
    root: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl CommandRunner {
    pub fn new(guard: CommandGuard, root: &Path, timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            guard,
            root: root.to_path_buf(),
            timeout,
            max_output_bytes,
        }
    }

    /// Executes `command` and returns its stdout.
    ///
    /// Nonzero exit yields `CommandExecution` carrying stderr (or the exit
    /// status when stderr is empty). No retry.
    pub async fn run(&self, command: &str) -> Result<String> {
        self.guard.check(command)?;

        debug!("Running command in {}: {command}", self.root.display());

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so subshells, pipelines and `&` jobs can be killed with sh.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.env_clear();
        for var_name in SAFE_ENV_VARS {
            if let Ok(value) = std::env::var(var_name) {
                cmd.env(var_name, value);
            }
        }
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        cmd.env("HOME", &self.root);
        cmd.env("TMPDIR", &self.root);

        let child = cmd.spawn()?;
        let _group = ProcessGroup { id: child.id() };

        // Every exit path drops `_group`, killing whatever is left.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Command timed out after {:?}: {command}", self.timeout);
                return Err(SandboxError::Timeout {
                    what: "command",
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            let status = output.status.code();
            let diagnostic = if stderr.is_empty() {
                match status {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            info!("Command failed ({status:?}): {command}");
            return Err(SandboxError::CommandExecution { status, diagnostic });
        }

        let stdout = truncate_output(&output.stdout, self.max_output_bytes);
        info!("Command succeeded: {command} ({} bytes of output)", stdout.len());
        Ok(stdout)
    }
}

/// Kills the command's process group on drop. `sh` leads the group, so
/// the group id is its pid.
struct ProcessGroup {
    id: Option<u32>,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(id) = self.id {
                kill_process_group(id);
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(id: u32) {
    let Ok(pgid) = libc::pid_t::try_from(id) else {
        return;
    };
    // SAFETY: killpg only sends a signal; it touches no memory of ours.
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group is already empty
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill process group {pgid}: {err}");
        }
    }
}

/// Lossy UTF-8 decode, cut at `max` bytes with a marker.
fn truncate_output(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..max]).into_owned();
    text.push_str(&format!("\n[output truncated, {} bytes total]", bytes.len()));
    text
}
