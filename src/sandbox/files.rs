/// Guarded file reads and writes under Root.
///
/// Every path goes through the `PathGuard` first. Writes land in a
/// temporary file in the target's directory and are renamed over the
/// target, so readers see either the old content or the new one, never
/// a mix.
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SandboxError};

use super::path_guard::PathGuard;

#[derive(Debug, Clone)]
pub struct FileAccess {
    guard: PathGuard,
}

impl FileAccess {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }

    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Returns the full text content of the file at `path`.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let full = self.guard.resolve(path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| not_found_or_io(e, path))?;
        debug!("Read {} ({} bytes)", full.display(), content.len());
        Ok(content)
    }

    /// Raw bytes, for attachments that are not text (images).
    pub async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.guard.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| not_found_or_io(e, path))
    }

    /// Replaces the file at `path` with `content`, creating missing
    /// parent directories.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full = self.guard.resolve(path)?;
        let parent = match full.parent() {
            Some(parent) if full != self.guard.root() => parent.to_path_buf(),
            _ => {
                return Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "cannot write to the data directory itself",
                )))
            }
        };

        tokio::fs::create_dir_all(&parent).await?;

        let bytes = content.as_bytes().to_vec();
        let target = full.clone();
        tokio::task::spawn_blocking(move || replace_file(&parent, &target, &bytes))
            .await
            .map_err(|e| SandboxError::Io(std::io::Error::other(e)))??;

        debug!("Wrote {} ({} bytes)", full.display(), content.len());
        Ok(())
    }
}

/// Write-then-rename within the same directory.
fn replace_file(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target)?;
    Ok(())
}

fn not_found_or_io(err: std::io::Error, path: &str) -> SandboxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SandboxError::NotFound {
            path: PathBuf::from(path),
        }
    } else {
        SandboxError::Io(err)
    }
}
