//! Persistence collaborator for finished sessions.
//!
//! Called once when a session completes. Failure is reported back to the
//! coordinator, which logs it and notifies observers; teardown proceeds
//! either way.

use fs_err as fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{CoreError, FinalizeError, Result};
use crate::session::WorkoutSnapshot;

pub trait SessionFinalizer: Send {
    fn finalize(&mut self, snapshot: &WorkoutSnapshot) -> std::result::Result<(), FinalizeError>;
}

/// Keeps nothing. Used when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFinalizer;

impl SessionFinalizer for DiscardFinalizer {
    fn finalize(&mut self, _snapshot: &WorkoutSnapshot) -> std::result::Result<(), FinalizeError> {
        Ok(())
    }
}

/// Writes each finished session to `<dir>/<session-id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileFinalizer {
    dir: PathBuf,
}

impl JsonFileFinalizer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.workout-sync/sessions`
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(CoreError::HomeDirNotFound)?;
        Ok(home.join(".workout-sync").join("sessions"))
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        let file_name: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }

    fn store(&self, session_id: &str, snapshot: &WorkoutSnapshot) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::Io {
            context: format!("creating {}", self.dir.display()),
            source: e,
        })?;
        let contents = serde_json::to_string_pretty(snapshot).map_err(|e| CoreError::Json {
            context: format!("serializing session {session_id}"),
            source: e,
        })?;
        let path = self.path_for(session_id);
        atomic_write(&path, &contents)?;
        Ok(path)
    }
}

impl SessionFinalizer for JsonFileFinalizer {
    fn finalize(&mut self, snapshot: &WorkoutSnapshot) -> std::result::Result<(), FinalizeError> {
        let session_id = snapshot.session_id.clone().unwrap_or_default();
        if session_id.is_empty() {
            return Err(FinalizeError {
                session_id,
                message: "session has no id".to_string(),
            });
        }
        self.store(&session_id, snapshot)
            .map(|path| tracing::debug!(path = %path.display(), "Stored finished session"))
            .map_err(|err| FinalizeError {
                session_id,
                message: err.to_string(),
            })
    }
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CoreError::Io {
        context: format!("creating temp file in {}", dir.display()),
        source: e,
    })?;

    tmp.write_all(contents.as_bytes()).map_err(|e| CoreError::Io {
        context: format!("writing temp file for {}", path.display()),
        source: e,
    })?;

    tmp.persist(path).map_err(|e| CoreError::Io {
        context: format!("persisting temp file to {}", path.display()),
        source: e.error,
    })?;

    Ok(())
}
