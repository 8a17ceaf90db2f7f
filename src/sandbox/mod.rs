//! Sandboxed file operations.
//!
//! All tool file access goes through a [`Sandbox`] rooted at a directory
//! captured once at startup. Paths are validated on every operation: no
//! absolute paths, no `..` segments, no symlinks, and the resolved path
//! must stay a descendant of the root.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;
use walkdir::WalkDir;

use crate::error::{ReplError, ReplResult};
use crate::types::ToolCall;

/// Maximum entries returned by a single `list` call.
pub const LIST_LIMIT: usize = 50;

pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Capture the sandbox root. The directory must exist; it is
    /// canonicalized once so later descendant checks are against a stable
    /// absolute path.
    pub fn new(root: impl Into<PathBuf>) -> ReplResult<Self> {
        let root = root.into().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uniform executor over the tool-call variants.
    pub async fn execute(&self, call: &ToolCall) -> ReplResult<String> {
        match call {
            ToolCall::ListFiles { pattern } => self.list(pattern).await,
            ToolCall::ReadFile { file_path } => self.read(file_path).await,
            ToolCall::WriteFile { file_path, content } => self.write(file_path, content).await,
        }
    }

    /// List relative paths under the root matching a shell glob, sorted
    /// lexicographically and truncated to [`LIST_LIMIT`] entries. `*` stays
    /// within one directory level; `**` crosses any depth.
    pub async fn list(&self, pattern: &str) -> ReplResult<String> {
        self.screen_pattern(pattern)?;

        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid glob pattern '{pattern}': {e}"))?
            .compile_matcher();

        let mut matches: Vec<String> = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.depth() == 0 {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            if matcher.is_match(rel) {
                matches.push(rel.to_string_lossy().into_owned());
            }
        }

        if matches.is_empty() {
            return Ok(format!("No files found matching pattern: {pattern}"));
        }

        matches.sort();
        let total = matches.len();
        matches.truncate(LIST_LIMIT);
        let mut out = matches.join("\n");
        if total > LIST_LIMIT {
            out.push_str(&format!("\n…({} more not shown)", total - LIST_LIMIT));
        }
        Ok(out)
    }

    /// Read the UTF-8 contents of a file.
    pub async fn read(&self, path: &str) -> ReplResult<String> {
        let full = self.validate(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ReplError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write content to a file, creating parent directories inside the
    /// sandbox as needed. The write is atomic: temp file in the target
    /// directory, then rename. Overwrite is allowed.
    pub async fn write(&self, path: &str, content: &str) -> ReplResult<String> {
        let full = self.validate(path)?;
        let parent = full.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        let body = content.to_string();
        let dest = full.clone();
        tokio::task::spawn_blocking(move || -> ReplResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(body.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&dest).map_err(|e| ReplError::IOFailure(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("write task failed: {e}"))??;

        tracing::debug!(path, bytes = content.len(), "sandbox write");
        Ok(format!("Successfully wrote to {path}"))
    }

    /// Validate a relative path and resolve it against the root.
    fn validate(&self, path: &str) -> ReplResult<PathBuf> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Err(ReplError::SecurityViolation(format!(
                "absolute paths not allowed: {path}"
            )));
        }

        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(ReplError::SecurityViolation(format!(
                        "parent directory references not allowed: {path}"
                    )));
                }
                _ => {
                    return Err(ReplError::SecurityViolation(format!(
                        "invalid path: {path}"
                    )));
                }
            }
        }

        let full = self.root.join(candidate);
        if !full.starts_with(&self.root) {
            return Err(ReplError::SecurityViolation(format!(
                "path escapes sandbox: {path}"
            )));
        }

        // No component of the resolved path may be (or traverse) a symlink.
        let mut current = self.root.clone();
        let rel = full.strip_prefix(&self.root).expect("descendant of root");
        for component in rel.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ReplError::SecurityViolation(format!(
                        "symlinks not allowed: {path}"
                    )));
                }
                // Missing components are fine; write creates them.
                _ => {}
            }
        }

        Ok(full)
    }

    fn screen_pattern(&self, pattern: &str) -> ReplResult<()> {
        if Path::new(pattern).is_absolute() {
            return Err(ReplError::SecurityViolation(format!(
                "absolute paths not allowed: {pattern}"
            )));
        }
        if pattern.split('/').any(|segment| segment == "..") {
            return Err(ReplError::SecurityViolation(format!(
                "parent directory references not allowed: {pattern}"
            )));
        }
        Ok(())
    }
}
