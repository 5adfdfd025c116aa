//! Derived cache invalidation.
//!
//! Rendered output cached under `cache_dir` may embed code from the
//! previous version of a package, so it is dropped after every install.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::UpdateConfig;
use crate::error::UpdateError;

/// Removes derived caches after a successful install.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    cache_dir: PathBuf,
    subdirs: Vec<String>,
    manifest_cache_file: String,
}

impl CacheInvalidator {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        subdirs: Vec<String>,
        manifest_cache_file: impl Into<String>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            subdirs,
            manifest_cache_file: manifest_cache_file.into(),
        }
    }

    pub fn from_config(config: &UpdateConfig) -> Self {
        Self::new(
            config.resolve(&config.paths.cache_dir),
            config.cache.subdirs.clone(),
            config.cache.manifest_cache_file.clone(),
        )
    }

    /// Remove every file below each cache subdirectory, except the
    /// subdirectory's own `.gitignore`, then the manifest cache file.
    ///
    /// Missing directories are skipped. Returns the number of files removed.
    pub fn clear(&self) -> Result<usize, UpdateError> {
        let mut removed = 0;

        for subdir in &self.subdirs {
            let dir = self.cache_dir.join(subdir);
            if !dir.is_dir() {
                continue;
            }
            let keep = dir.join(".gitignore");
            removed += remove_files_below(&dir, &keep)?;
        }

        let manifest_cache = self.cache_dir.join(&self.manifest_cache_file);
        if manifest_cache.is_file() {
            std::fs::remove_file(&manifest_cache)?;
            removed += 1;
        }

        debug!("Cleared {} cached files from {:?}", removed, self.cache_dir);
        Ok(removed)
    }
}

fn remove_files_below(dir: &Path, keep: &Path) -> Result<usize, UpdateError> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removed += remove_files_below(&path, keep)?;
        } else if path != keep {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove cache file {:?}: {}", path, e);
                    return Err(e.into());
                }
            }
        }
    }
    Ok(removed)
}
