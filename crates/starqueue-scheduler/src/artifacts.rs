//! Artifact storage — the image files produced by completed tasks.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact reference: {0:?}")]
    InvalidReference(String),

    #[error("failed to delete artifact {reference}: {source}")]
    Delete {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where task artifacts live. References are the `filename` values stored
/// on completed task rows.
pub trait ArtifactStore: Send + Sync {
    fn delete(&self, reference: &str) -> Result<(), ArtifactError>;
}

/// Artifacts stored as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a reference to a path below the root. Only plain relative paths
    /// are accepted.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(reference);
        let plain = !reference.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(ArtifactError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn delete(&self, reference: &str) -> Result<(), ArtifactError> {
        let path = self.resolve(reference)?;
        std::fs::remove_file(&path).map_err(|source| ArtifactError::Delete {
            reference: reference.to_string(),
            source,
        })?;
        debug!(path = %path.display(), "artifact deleted");
        Ok(())
    }
}
