use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced while snapshotting, persisting, or exchanging cached state.
///
/// Store reads are fail-safe: corruption is turned into a miss at the store
/// boundary, so the record-level variants below mostly surface from writes,
/// packing, and explicit validation helpers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("io error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("invalid record in {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    #[error("checksum mismatch for {what}: expected {expected}, found {found}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        found: String,
    },

    #[error("incompatible record format version: expected {expected}, found {found}")]
    IncompatibleFormatVersion { expected: u32, found: u32 },

    #[error("invalid archive path: {path:?}")]
    InvalidArchivePath { path: PathBuf },

    #[error("unsupported archive entry type for {path:?}")]
    UnsupportedArchiveEntryType { path: PathBuf },

    #[error("archive entry {path:?} does not belong to any declared output")]
    UnexpectedArchiveEntry { path: PathBuf },

    #[error("http request failed: {message}")]
    Http { message: String },

    #[error("unsupported remote cache url: {url}")]
    UnsupportedRemoteUrl { url: String },

    #[error("cache entry {cache_key} is {size} bytes, over the {limit} byte limit")]
    EntryTooLarge {
        cache_key: String,
        size: usize,
        limit: usize,
    },

    #[error("lock {path} could not be acquired: {reason}")]
    Lock { path: PathBuf, reason: String },
}

impl CacheError {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` when the error is an I/O "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::Io(err) | CacheError::IoAt { source: err, .. } => {
                err.kind() == std::io::ErrorKind::NotFound
            }
            CacheError::WalkDir(err) => err
                .io_error()
                .is_some_and(|err| err.kind() == std::io::ErrorKind::NotFound),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_at_display_includes_path() {
        let err = CacheError::io_at(
            "/tmp/keel/state/abc.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("abc.bin"), "{message}");
        assert!(message.contains("denied"), "{message}");
    }

    #[test]
    fn not_found_is_detected_through_wrappers() {
        let plain = CacheError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(plain.is_not_found());

        let at = CacheError::io_at("x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(at.is_not_found());

        let other = CacheError::Http {
            message: "boom".to_string(),
        };
        assert!(!other.is_not_found());
    }

    #[test]
    fn checksum_mismatch_display() {
        let err = CacheError::ChecksumMismatch {
            what: "cache entry".to_string(),
            expected: "aabb".to_string(),
            found: "ccdd".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("aabb"));
        assert!(message.contains("ccdd"));
    }
}
