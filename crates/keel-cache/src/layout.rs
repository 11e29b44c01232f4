use crate::error::{CacheError, Result};
use std::path::{Path, PathBuf};

/// Directory layout under a keel cache root.
///
/// ```text
/// <root>/state/       execution-state records, one per identity
/// <root>/cache/       local cache entries, one per cache key
/// <root>/workspaces/  in-place workspaces and their lock files
/// <root>/immutable/   published immutable workspaces, one per cache key
/// <root>/tmp/         staging directories for immutable workspaces
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Creates every directory of the layout under `root`.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let layout = Self {
            root: root.as_ref().to_path_buf(),
        };
        for dir in [
            layout.state_dir(),
            layout.cache_dir(),
            layout.workspaces_dir(),
            layout.immutable_dir(),
            layout.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|err| CacheError::io_at(&dir, err))?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn immutable_dir(&self) -> PathBuf {
        self.root.join("immutable")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

/// `~/.keel/cache`, resolved from `HOME` (or `USERPROFILE` on Windows).
pub fn default_cache_root() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".keel").join("cache"))
}
