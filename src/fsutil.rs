//! Small filesystem utilities: per-session workspaces and trace bundle lookup.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::{ProfError, ProfResult};

/// Directory owned by one recording session.
///
/// Removed on drop unless `keep` was requested.
#[derive(Debug)]
pub struct SessionDir {
    path: PathBuf,
    keep: bool,
}

impl SessionDir {
    pub fn create(parent: &Path, keep: bool) -> ProfResult<Self> {
        let path = parent.join(format!("xctrace-prof-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        if self.keep {
            tracing::debug!("keeping session artifacts at {}", self.path.display());
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("failed to remove {}: {err}", self.path.display());
        }
    }
}

/// Finds the single `*.trace` bundle inside `dir`.
pub fn find_trace_bundle(dir: &Path) -> ProfResult<PathBuf> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("trace") {
            found.push(path);
        }
    }
    found.sort();
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(ProfError::RecordingFailed(format!(
            "no trace bundle found in {}",
            dir.display()
        ))),
        n => Err(ProfError::RecordingFailed(format!(
            "expected one trace bundle in {}, found {n}: {found:?}",
            dir.display()
        ))),
    }
}

/// Last `max_lines` lines of a text file, for failure messages.
pub fn tail_lines(path: &Path, max_lines: usize) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join(" | ")
}
