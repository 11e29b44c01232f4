use crate::error::{ExecutionError, Result};
use keel_cache::{default_cache_root, LocalCachePolicy, LockOptions};
use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::PathBuf;

pub const CACHE_DIR_ENV: &str = "KEEL_CACHE_DIR";
pub const REMOTE_CACHE_ENV: &str = "KEEL_REMOTE_CACHE";
pub const WORKERS_ENV: &str = "KEEL_WORKERS";
pub const NO_HASH_CACHE_ENV: &str = "KEEL_NO_HASH_CACHE";

/// Settings for an [`ExecutionEngine`](crate::ExecutionEngine) and its
/// [`WorkerPool`](crate::WorkerPool).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root of the on-disk layout (see [`keel_cache::CacheLayout`]).
    pub cache_root: PathBuf,
    /// `http(s)://` base URL, `file://` URL, or directory of a shared cache.
    pub remote_cache: Option<String>,
    /// Reuse content hashes of files whose length and mtime are unchanged.
    pub use_hash_cache: bool,
    /// Size of the pool built by [`WorkerPool::from_config`](crate::WorkerPool::from_config).
    pub workers: usize,
    pub lock: LockOptions,
    pub local_cache: LocalCachePolicy,
}

impl EngineConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            remote_cache: None,
            use_hash_cache: true,
            workers: default_workers(),
            lock: LockOptions::default(),
            local_cache: LocalCachePolicy::default(),
        }
    }

    /// Reads `KEEL_CACHE_DIR`, `KEEL_REMOTE_CACHE`, `KEEL_WORKERS` and
    /// `KEEL_NO_HASH_CACHE`, falling back to `~/.keel/cache`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let cache_root = match non_empty(CACHE_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => default_cache_root()?,
        };
        let mut config = Self::new(cache_root);

        config.remote_cache = non_empty(REMOTE_CACHE_ENV)
            .map(|url| url.to_string_lossy().trim().to_string())
            .filter(|url| !url.is_empty());

        if let Some(raw) = non_empty(WORKERS_ENV) {
            let raw = raw.to_string_lossy().trim().to_string();
            config.workers = match raw.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ExecutionError::InvalidConfig {
                        key: WORKERS_ENV,
                        value: raw,
                        reason: "expected a positive integer".to_string(),
                    })
                }
                Ok(workers) => workers,
            };
        }

        if let Some(raw) = non_empty(NO_HASH_CACHE_ENV) {
            config.use_hash_cache = !is_truthy(&raw.to_string_lossy());
        }

        Ok(config)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Number of available cores, or 1 when it cannot be determined.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), OsString::from(value)))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn reads_all_settings() {
        let config = EngineConfig::from_lookup(lookup(&[
            (CACHE_DIR_ENV, "/var/cache/keel"),
            (REMOTE_CACHE_ENV, " https://cache.example.com/keel "),
            (WORKERS_ENV, "3"),
            (NO_HASH_CACHE_ENV, "true"),
        ]))
        .unwrap();

        assert_eq!(config.cache_root, PathBuf::from("/var/cache/keel"));
        assert_eq!(
            config.remote_cache.as_deref(),
            Some("https://cache.example.com/keel")
        );
        assert_eq!(config.workers, 3);
        assert!(!config.use_hash_cache);
        assert_eq!(config.lock, LockOptions::default());
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[(CACHE_DIR_ENV, "/c")])).unwrap();
        assert_eq!(config.remote_cache, None);
        assert!(config.use_hash_cache);
        assert_eq!(config.workers, default_workers());
        assert_eq!(config.local_cache, LocalCachePolicy::default());
    }

    #[test]
    fn rejects_invalid_worker_count() {
        for bad in ["0", "many", "-2"] {
            let err = EngineConfig::from_lookup(lookup(&[
                (CACHE_DIR_ENV, "/c"),
                (WORKERS_ENV, bad),
            ]))
            .unwrap_err();
            assert!(
                matches!(err, ExecutionError::InvalidConfig { key: WORKERS_ENV, .. }),
                "{err}"
            );
        }
    }

    #[test]
    fn hash_cache_toggle_accepts_falsy_values() {
        let config = EngineConfig::from_lookup(lookup(&[
            (CACHE_DIR_ENV, "/c"),
            (NO_HASH_CACHE_ENV, "0"),
        ]))
        .unwrap();
        assert!(config.use_hash_cache);
    }
}
