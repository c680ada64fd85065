//! Root containment for untrusted relative paths.
//!
//! A path is admitted only if, after lexical cleanup and symlink
//! resolution, it is Root itself or lies below it. Containment uses
//! `Path::starts_with`, which compares whole components, so a sibling
//! such as `/data-other` never matches a root of `/data`.

use std::path::{Path, PathBuf};

use path_clean::PathClean;
use tracing::warn;

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Builds a guard for an existing directory. The root is canonicalized
    /// once here and never changes afterwards.
    pub fn new(root: &Path) -> Result<Self> {
        let root = std::fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `relative` against Root.
    ///
    /// Backslashes count as separators so `..\..\x` cannot hide a
    /// traversal inside a single file name. Missing trailing components
    /// are allowed (write targets), but every existing prefix is resolved
    /// through the filesystem, so a symlink pointing out of Root is caught.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        // No filesystem path can hold a NUL; reject before any lookup.
        if relative.contains('\0') {
            return Err(self.escape(relative));
        }
        let normalized = relative.replace('\\', "/");
        let candidate = self.root.join(&normalized).clean();
        if !candidate.starts_with(&self.root) {
            return Err(self.escape(relative));
        }

        let resolved = canonicalize_existing_prefix(&candidate)?;
        if !resolved.starts_with(&self.root) {
            return Err(self.escape(relative));
        }
        Ok(resolved)
    }

    fn escape(&self, relative: &str) -> SandboxError {
        warn!("Path escape rejected: {relative:?} (root {})", self.root.display());
        SandboxError::PathEscape {
            path: relative.to_string(),
        }
    }
}

/// Canonicalizes the deepest ancestor that exists and re-appends the rest.
/// `path` must already be clean, so the remainder holds no `..`.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    for ancestor in path.ancestors() {
        if let Ok(real) = std::fs::canonicalize(ancestor) {
            let rest = path.strip_prefix(ancestor).unwrap_or(Path::new(""));
            return Ok(if rest.as_os_str().is_empty() {
                real
            } else {
                real.join(rest)
            });
        }
    }
    Err(SandboxError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no existing ancestor for {}", path.display()),
    )))
}
