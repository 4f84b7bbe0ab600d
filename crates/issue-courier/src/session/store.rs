//! File-backed session store.
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous state loadable. Anything that cannot
//! be read back is treated as "no session".

use super::{SessionState, STATE_VERSION};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state. Absent, unreadable, corrupt, or
    /// wrong-version files all yield `None`.
    pub fn load(&self) -> Option<SessionState> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved session");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "saved session unreadable, ignoring");
                return None;
            }
        };

        match serde_json::from_slice::<SessionState>(&raw) {
            Ok(state) if state.version == STATE_VERSION && !state.is_empty() => Some(state),
            Ok(state) => {
                warn!(
                    path = %self.path.display(),
                    version = state.version,
                    cookies = state.cookies.len(),
                    "saved session unusable, ignoring"
                );
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "saved session corrupt, ignoring");
                None
            }
        }
    }

    /// Persist `state`, replacing any previous file atomically.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_vec_pretty(state)?;
        let tmp = temp_path(&self.path);
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e)
                .with_context(|| format!("failed to move session into {}", self.path.display()));
        }

        debug!(path = %self.path.display(), cookies = state.cookies.len(), "session saved");
        Ok(())
    }

    /// Delete the saved state. Returns whether a file was removed.
    pub fn clear(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("storage.json");
    path.with_file_name(format!(".{name}.tmp"))
}
