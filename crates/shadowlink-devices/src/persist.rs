//! JSON state-file persistence for devices that survive restarts.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

/// A device's on-disk state snapshot.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or `None` if the file is absent or unreadable.
    pub async fn load<T: DeserializeOwned>(&self) -> Option<T> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read state file {}: {}", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(state) => {
                debug!("Loaded state from {}", self.path.display());
                Some(state)
            }
            Err(e) => {
                warn!(
                    "Corrupt state file {}: {}. Using default state.",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Write the snapshot. Failures are logged and otherwise ignored.
    pub async fn save<T: Serialize>(&self, state: &T) {
        if let Err(e) = self.try_save(state).await {
            error!("Failed to save state to {}: {}", self.path.display(), e);
        }
    }

    async fn try_save<T: Serialize>(&self, state: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let contents = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, contents).await
    }
}
