use keel_cache::{
    CacheError, CacheLayout, ExecutionState, FileLock, FileSystemSnapshot, HashCode,
    HeartbeatLock, LockOptions,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Hands out exclusive, per-identity workspaces.
#[derive(Clone, Debug)]
pub struct WorkspaceProvider {
    layout: CacheLayout,
    lock_options: LockOptions,
}

impl WorkspaceProvider {
    pub fn new(layout: CacheLayout, lock_options: LockOptions) -> Self {
        Self {
            layout,
            lock_options,
        }
    }

    /// Blocks until `identity` is free in this and every other process, then
    /// returns its workspace. The lock is released when the workspace drops.
    pub fn acquire(&self, identity: &str) -> Result<Workspace, CacheError> {
        let slot = HashCode::of_bytes(identity.as_bytes()).to_hex();
        let workspaces = self.layout.workspaces_dir();
        let lock = HeartbeatLock::acquire(
            &workspaces.join(format!("{slot}.lock")),
            self.lock_options,
        )?;

        let dir = workspaces.join(slot);
        std::fs::create_dir_all(&dir).map_err(|err| CacheError::IoAt {
            path: dir.clone(),
            source: err,
        })?;
        tracing::debug!(
            target = "keel.execution",
            identity,
            dir = %dir.display(),
            "workspace acquired"
        );
        Ok(Workspace {
            identity: identity.to_string(),
            dir,
            _lock: lock,
        })
    }

    /// Moves a finished staging directory to `immutable/<cache-key>/`.
    ///
    /// Returns `false` when the key is already published. The existing
    /// directory is kept, since other callers may hold paths into it, and
    /// `staging` is left for the caller to discard.
    pub fn publish_immutable(
        &self,
        staging: &Path,
        cache_key: &HashCode,
    ) -> Result<bool, CacheError> {
        let immutable = self.layout.immutable_dir();
        let target = self.immutable_dir(cache_key);
        let _guard = FileLock::lock_exclusive(&immutable.join(format!("{cache_key}.lock")))?;
        if target.exists() {
            tracing::debug!(
                target = "keel.execution",
                cache_key = %cache_key,
                "immutable workspace already published"
            );
            return Ok(false);
        }
        std::fs::rename(staging, &target).map_err(|err| CacheError::IoAt {
            path: target.clone(),
            source: err,
        })?;
        Ok(true)
    }

    pub fn immutable_dir(&self, cache_key: &HashCode) -> PathBuf {
        self.layout.immutable_dir().join(cache_key.to_hex())
    }

    /// A fresh directory under `tmp/`, removed on drop unless published.
    pub fn staging_dir(&self) -> Result<tempfile::TempDir, CacheError> {
        let tmp = self.layout.tmp_dir();
        tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(&tmp)
            .map_err(|err| CacheError::IoAt {
                path: tmp,
                source: err,
            })
    }
}

/// An identity's workspace, exclusively held until dropped.
#[derive(Debug)]
pub struct Workspace {
    identity: String,
    dir: PathBuf,
    _lock: HeartbeatLock,
}

impl Workspace {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves a declared output path; relative paths land in the workspace.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    /// Releases the lock now rather than at end of scope.
    pub fn release(self) {}
}

/// Files present in the output locations that the previous execution of
/// this identity did not produce.
///
/// Without a previous execution, any file present counts.
pub fn find_overlapping_outputs(
    locations: &BTreeMap<String, PathBuf>,
    current: &BTreeMap<String, FileSystemSnapshot>,
    previous: Option<&ExecutionState>,
) -> Vec<PathBuf> {
    let mut unexpected = Vec::new();
    for (name, snapshot) in current {
        let Some(location) = locations.get(name) else {
            continue;
        };
        let recorded: BTreeSet<String> = previous
            .and_then(|state| state.outputs.get(name))
            .map(|recorded| recorded.file_paths().into_iter().collect())
            .unwrap_or_default();
        for relative in snapshot.file_paths() {
            if !recorded.contains(&relative) {
                unexpected.push(if relative.is_empty() {
                    location.clone()
                } else {
                    location.join(relative)
                });
            }
        }
    }
    unexpected
}
