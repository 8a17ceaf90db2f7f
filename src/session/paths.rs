//! Project-scoped storage layout.
//!
//! Sessions, the persisted context, and the session-name mapping live under
//! `<base>/projects/<project>/`, where `<project>` is the working directory
//! with path separators collapsed to dashes. `<base>` is `~/.gemini` by
//! default, or `./logs` in dev mode.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{ReplError, ReplResult};

pub const DEV_BASE_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub base_dir: PathBuf,
    pub project_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub context_file: PathBuf,
    pub names_file: PathBuf,
}

impl ProjectPaths {
    /// Resolve paths for the current working directory.
    pub fn resolve(dev_mode: bool) -> ReplResult<Self> {
        let cwd = std::env::current_dir()?;
        let base = if dev_mode {
            PathBuf::from(DEV_BASE_DIR)
        } else {
            dirs::home_dir()
                .ok_or_else(|| ReplError::FatalConfig("cannot determine home directory".into()))?
                .join(".gemini")
        };
        Self::under(base, &cwd)
    }

    /// Resolve paths under an explicit base directory (tests, dev tooling).
    pub fn under(base: impl Into<PathBuf>, project_path: &Path) -> ReplResult<Self> {
        let base_dir = base.into();
        let project_dir = base_dir.join("projects").join(project_name(project_path));
        let sessions_dir = project_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;
        Ok(Self {
            context_file: project_dir.join("context.json"),
            names_file: project_dir.join("names"),
            base_dir,
            project_dir,
            sessions_dir,
        })
    }

    pub fn session_file(&self, session_id: &Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.jsonl"))
    }
}

/// Directory name for a project: the absolute path with separators dashed,
/// runs of dashes collapsed.
fn project_name(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let dashed: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect();
    let mut out = String::with_capacity(dashed.len());
    for c in dashed.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_dashes_separators() {
        assert_eq!(project_name(Path::new("/home/user/proj")), "home-user-proj");
    }

    #[test]
    fn project_name_collapses_runs() {
        assert_eq!(project_name(Path::new("/a//b/")), "a-b");
    }

    #[test]
    fn under_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ProjectPaths::under(dir.path(), Path::new("/work/demo")).unwrap();
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.sessions_dir.ends_with("projects/work-demo/sessions"));
        assert_eq!(paths.context_file.file_name().unwrap(), "context.json");
        assert_eq!(paths.names_file.file_name().unwrap(), "names");

        let id = Uuid::new_v4();
        let file = paths.session_file(&id);
        assert_eq!(file.extension().unwrap(), "jsonl");
        assert!(file.starts_with(&paths.sessions_dir));
    }
}
