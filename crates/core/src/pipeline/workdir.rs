//! Per-job scratch directories.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Allocates and releases job working directories under one root.
#[derive(Debug, Clone)]
pub struct WorkDirs {
    root: PathBuf,
}

impl WorkDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for one chain of `job_id`.
    ///
    /// The name is unique per call, so a restarted chain never reuses the
    /// directory of an earlier one.
    pub async fn allocate(&self, job_id: i64) -> io::Result<PathBuf> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let path = self.root.join(format!("job-{}-{}", job_id, &suffix[..12]));
        tokio::fs::create_dir_all(&path).await?;
        debug!("Allocated working directory {:?}", path);
        Ok(path)
    }

    /// Remove a working directory. Returns whether something was removed.
    ///
    /// Paths outside the root are refused.
    pub async fn release(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) || path == self.root {
            warn!(
                "Refusing to remove {:?}: not a working directory under {:?}",
                path, self.root
            );
            return false;
        }

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                debug!("Released working directory {:?}", path);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Failed to remove working directory {:?}: {}", path, e);
                false
            }
        }
    }
}
