//! Persistence layer for keel's incremental execution engine.
//!
//! This crate owns everything that touches disk or the network on behalf of
//! the engine:
//! - content hashing ([`HashCode`], [`Hasher`]) and file-system snapshots
//! - input fingerprinting under a [`NormalizationStrategy`]
//! - the per-identity [`ExecutionStateStore`]
//! - the two-tier [`BuildCache`] (local store plus optional [`RemoteCache`])
//! - heartbeat-based cross-process locks
//!
//! ## On-disk layout
//!
//! See [`CacheLayout`]. Every persisted record (execution state, cache entry)
//! is a `bincode` envelope carrying magic bytes, a format version, the keel
//! version, and a SHA-256 checksum of the payload; anything that does not
//! verify is treated as absent. Output trees inside cache entries are packed
//! as `tar.zst`.

mod cache_store;
mod error;
mod execution_state;
mod fingerprint;
mod hash;
mod layout;
mod lock;
mod pack;
mod record;
mod remote;
mod snapshot;
mod util;

pub use cache_store::{
    BuildCache, CacheEntry, CacheOrigin, GcStats, LocalCachePolicy, LocalCacheStore,
    CACHE_ENTRY_FORMAT_VERSION,
};
pub use error::{CacheError, Result};
pub use execution_state::{
    ExecutionState, ExecutionStateStore, RecordedOutcome, EXECUTION_STATE_FORMAT_VERSION,
};
pub use fingerprint::{DirectorySensitivity, Fingerprinter, NormalizationStrategy, ScalarValue};
pub use hash::{HashCode, Hasher};
pub use layout::{default_cache_root, CacheLayout};
pub use lock::{FileLock, HeartbeatLock, LockOptions, LockOwner};
pub use pack::{pack_outputs, unpack_outputs};
pub use remote::{remote_cache_for_url, DirectoryRemoteCache, HttpRemoteCache, RemoteCache};
pub use snapshot::{
    FileCollectionSnapshot, FileHashCache, FileSnapshotter, FileSystemSnapshot, RootedSnapshot,
};
pub use util::{atomic_write, now_millis, remove_path, BINCODE_PAYLOAD_LIMIT_BYTES};

/// Version stamped into every persisted record; records written by another
/// version are ignored.
pub const KEEL_VERSION: &str = env!("CARGO_PKG_VERSION");
