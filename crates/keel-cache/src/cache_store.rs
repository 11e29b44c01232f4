use crate::error::{CacheError, Result};
use crate::hash::HashCode;
use crate::pack::{pack_outputs, unpack_outputs};
use crate::record::{self, RecordKind, HEADER_LEN};
use crate::remote::RemoteCache;
use crate::snapshot::{FileSnapshotter, FileSystemSnapshot};
use crate::util::{
    atomic_write, is_tmp_file_name, now_millis, read_file_limited, remove_file_best_effort,
    BINCODE_PAYLOAD_LIMIT_BYTES,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const CACHE_ENTRY_FORMAT_VERSION: u32 = 1;

const ENTRY_RECORD: RecordKind = RecordKind {
    magic: *b"KEELCACH",
    format_version: CACHE_ENTRY_FORMAT_VERSION,
    what: "cache entry",
};

/// Minimum time between opportunistic GC runs triggered by writes.
const GC_INTERVAL_MILLIS: u64 = 5 * 60 * 1000;

/// Temp files younger than this may belong to an in-flight write.
const TMP_GRACE: Duration = Duration::from_secs(60);

/// Where a cache entry came from. Informational only; never part of a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOrigin {
    pub identity: String,
    pub display_name: String,
    pub execution_millis: u64,
    pub created_at_millis: u64,
}

/// Packed outputs of one execution, addressed by cache key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: HashCode,
    pub origin: CacheOrigin,
    pub outputs: BTreeMap<String, FileSystemSnapshot>,
    pub packed: Vec<u8>,
}

impl CacheEntry {
    /// Packs the current content of `locations`, which must match `outputs`.
    pub fn capture(
        cache_key: HashCode,
        origin: CacheOrigin,
        locations: &BTreeMap<String, PathBuf>,
        outputs: BTreeMap<String, FileSystemSnapshot>,
    ) -> Result<Self> {
        let packed = pack_outputs(locations, &outputs)?;
        Ok(Self {
            cache_key,
            origin,
            outputs,
            packed,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        record::encode(ENTRY_RECORD, self)
    }

    /// Decodes and verifies an entry that was stored under `cache_key`.
    pub fn from_bytes(cache_key: &HashCode, bytes: &[u8]) -> Result<Self> {
        let entry: CacheEntry = record::decode(ENTRY_RECORD, bytes)?;
        if entry.cache_key != *cache_key {
            return Err(CacheError::InvalidRecord {
                path: PathBuf::from(cache_key.to_hex()),
                reason: format!("entry was recorded for cache key {}", entry.cache_key),
            });
        }
        Ok(entry)
    }

    /// Writes the packed outputs into `locations` and checks the result
    /// against the recorded snapshots.
    ///
    /// Returns `Ok(false)` when the restored files differ from what was
    /// recorded; the caller must then treat the entry as a miss.
    pub fn restore(
        &self,
        locations: &BTreeMap<String, PathBuf>,
        snapshotter: &FileSnapshotter,
    ) -> Result<bool> {
        unpack_outputs(&self.packed, locations, &self.outputs)?;
        for (name, expected) in &self.outputs {
            let Some(location) = locations.get(name) else {
                return Ok(false);
            };
            let actual = snapshotter.snapshot(location)?;
            if actual != *expected {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %self.cache_key,
                    output = %name,
                    "restored output does not match the cache entry"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Eviction policy for [`LocalCacheStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalCachePolicy {
    /// Upper bound for the total size of entry files.
    pub max_bytes: u64,
    /// Entries not used for longer than this are removed.
    pub max_age: Duration,
    /// Largest encoded entry that is written to any tier. Clamped to
    /// [`BINCODE_PAYLOAD_LIMIT_BYTES`], above which entries cannot be read back.
    pub max_entry_bytes: usize,
}

impl LocalCachePolicy {
    pub fn entry_limit(&self) -> usize {
        self.max_entry_bytes.min(BINCODE_PAYLOAD_LIMIT_BYTES)
    }
}

impl Default for LocalCachePolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024 * 1024,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            max_entry_bytes: BINCODE_PAYLOAD_LIMIT_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub removed_entries: usize,
    pub removed_bytes: u64,
    pub remaining_bytes: u64,
}

/// The on-disk cache tier: one `<cache-key>.bin` file per entry.
///
/// An entry's modification time doubles as its last-used time; hits refresh
/// it so LRU eviction keeps what is actually reused.
#[derive(Clone, Debug)]
pub struct LocalCacheStore {
    root: PathBuf,
    policy: LocalCachePolicy,
    last_gc_millis: Arc<AtomicU64>,
}

impl LocalCacheStore {
    pub fn new(root: impl AsRef<Path>, policy: LocalCachePolicy) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            policy,
            last_gc_millis: Arc::new(AtomicU64::new(now_millis())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> LocalCachePolicy {
        self.policy
    }

    pub fn contains(&self, cache_key: &HashCode) -> bool {
        self.entry_path(cache_key).is_file()
    }

    pub fn load(&self, cache_key: &HashCode) -> Option<CacheEntry> {
        let path = self.entry_path(cache_key);
        let bytes = read_file_limited(&path)?;
        match CacheEntry::from_bytes(cache_key, &bytes) {
            Ok(entry) => {
                touch_best_effort(&path);
                Some(entry)
            }
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %cache_key,
                    path = %path.display(),
                    error = %err,
                    "discarding corrupt cache entry"
                );
                remove_file_best_effort(&path, "cache_entry.corrupt");
                None
            }
        }
    }

    /// Stores `entry` unless an entry for its key already exists.
    ///
    /// Entries over the policy's size limit are refused with
    /// [`CacheError::EntryTooLarge`].
    pub fn store(&self, entry: &CacheEntry) -> Result<()> {
        if self.touch_existing(&entry.cache_key) {
            return Ok(());
        }
        let bytes = entry.to_bytes()?;
        self.check_entry_size(&entry.cache_key, &bytes)?;
        self.write_entry(&self.entry_path(&entry.cache_key), &bytes)
    }

    fn touch_existing(&self, cache_key: &HashCode) -> bool {
        let path = self.entry_path(cache_key);
        let exists = path.is_file();
        if exists {
            touch_best_effort(&path);
        }
        exists
    }

    fn check_entry_size(&self, cache_key: &HashCode, bytes: &[u8]) -> Result<()> {
        let limit = self.policy.entry_limit();
        if bytes.len() > limit {
            return Err(CacheError::EntryTooLarge {
                cache_key: cache_key.to_hex(),
                size: bytes.len(),
                limit,
            });
        }
        Ok(())
    }

    /// Stores bytes already verified by [`CacheEntry::from_bytes`].
    pub(crate) fn store_verified_bytes(&self, cache_key: &HashCode, bytes: &[u8]) -> Result<()> {
        self.write_entry(&self.entry_path(cache_key), bytes)
    }

    pub fn remove(&self, cache_key: &HashCode) -> bool {
        remove_file_best_effort(&self.entry_path(cache_key), "cache_entry.remove")
    }

    fn write_entry(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        atomic_write(path, bytes)?;
        self.maybe_gc();
        Ok(())
    }

    fn entry_path(&self, cache_key: &HashCode) -> PathBuf {
        self.root.join(format!("{cache_key}.bin"))
    }

    fn maybe_gc(&self) {
        let now = now_millis();
        let last = self.last_gc_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last) < GC_INTERVAL_MILLIS {
            return;
        }
        if self
            .last_gc_millis
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        if let Err(err) = self.gc() {
            tracing::debug!(target = "keel.cache", error = %err, "cache gc failed");
        }
    }

    /// Removes expired entries, then least-recently-used entries until the
    /// store fits in `max_bytes`. Foreign, corrupt, and abandoned temp files
    /// are removed along the way.
    pub fn gc(&self) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(err) => return Err(CacheError::io_at(&self.root, err)),
        };

        let now = SystemTime::now();
        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let len = meta.len();
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            let name = entry.file_name().to_string_lossy().into_owned();

            let keep = if is_tmp_file_name(&name) {
                age < TMP_GRACE
            } else if !is_entry_file_name(&name) || !has_entry_header(&path) {
                false
            } else {
                age <= self.policy.max_age
            };

            if keep {
                if !is_tmp_file_name(&name) {
                    candidates.push((age, len, path));
                }
                stats.remaining_bytes = stats.remaining_bytes.saturating_add(len);
            } else if remove_file_best_effort(&path, "cache_gc.expired") {
                stats.removed_entries += 1;
                stats.removed_bytes = stats.removed_bytes.saturating_add(len);
            }
        }

        if stats.remaining_bytes > self.policy.max_bytes {
            // Oldest use first.
            candidates.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, len, path) in candidates {
                if stats.remaining_bytes <= self.policy.max_bytes {
                    break;
                }
                if remove_file_best_effort(&path, "cache_gc.evicted") {
                    stats.removed_entries += 1;
                    stats.removed_bytes = stats.removed_bytes.saturating_add(len);
                    stats.remaining_bytes = stats.remaining_bytes.saturating_sub(len);
                }
            }
        }

        tracing::debug!(
            target = "keel.cache",
            root = %self.root.display(),
            removed = stats.removed_entries,
            remaining_bytes = stats.remaining_bytes,
            "cache gc finished"
        );
        Ok(stats)
    }
}

fn is_entry_file_name(name: &str) -> bool {
    name.strip_suffix(".bin")
        .is_some_and(|stem| stem.parse::<HashCode>().is_ok())
}

fn has_entry_header(path: &Path) -> bool {
    let mut prefix = [0u8; HEADER_LEN];
    std::fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut prefix))
        .is_ok_and(|()| record::has_header(ENTRY_RECORD, &prefix))
}

fn touch_best_effort(path: &Path) {
    let touched = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = touched {
        tracing::debug!(
            target = "keel.cache",
            path = %path.display(),
            error = %err,
            "failed to refresh cache entry access time"
        );
    }
}

/// The two-tier cache consulted by the engine: local first, then remote.
///
/// Reads never fail; any error degrades to a miss. Writes are best effort
/// and only logged, so an unavailable cache never fails a build.
#[derive(Clone, Debug)]
pub struct BuildCache {
    local: LocalCacheStore,
    remote: Option<Arc<dyn RemoteCache>>,
}

impl BuildCache {
    pub fn new(local: LocalCacheStore, remote: Option<Arc<dyn RemoteCache>>) -> Self {
        Self { local, remote }
    }

    pub fn local(&self) -> &LocalCacheStore {
        &self.local
    }

    pub fn remote(&self) -> Option<&dyn RemoteCache> {
        self.remote.as_deref()
    }

    pub fn load(&self, cache_key: &HashCode) -> Option<CacheEntry> {
        if let Some(entry) = self.local.load(cache_key) {
            tracing::debug!(target = "keel.cache", cache_key = %cache_key, "local cache hit");
            return Some(entry);
        }
        let remote = self.remote.as_ref()?;

        let bytes = match remote.load(cache_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(target = "keel.cache", cache_key = %cache_key, "cache miss");
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %cache_key,
                    remote = %remote.describe(),
                    error = %err,
                    "remote cache read failed; treating as a miss"
                );
                return None;
            }
        };
        let entry = match CacheEntry::from_bytes(cache_key, &bytes) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %cache_key,
                    remote = %remote.describe(),
                    error = %err,
                    "ignoring corrupt remote cache entry"
                );
                return None;
            }
        };

        if let Err(err) = self.local.store_verified_bytes(cache_key, &bytes) {
            tracing::warn!(
                target = "keel.cache",
                cache_key = %cache_key,
                error = %err,
                "failed to copy remote cache entry into the local cache"
            );
        }
        tracing::debug!(target = "keel.cache", cache_key = %cache_key, "remote cache hit");
        Some(entry)
    }

    /// Stores `entry` in every tier, logging instead of failing.
    ///
    /// An entry too large to be read back is written nowhere.
    pub fn store(&self, entry: &CacheEntry) {
        let cache_key = &entry.cache_key;
        let bytes = match entry
            .to_bytes()
            .and_then(|bytes| self.local.check_entry_size(cache_key, &bytes).map(|()| bytes))
        {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %cache_key,
                    error = %err,
                    "not storing cache entry"
                );
                return;
            }
        };

        if !self.local.touch_existing(cache_key) {
            if let Err(err) = self.local.write_entry(&self.local.entry_path(cache_key), &bytes) {
                tracing::warn!(
                    target = "keel.cache",
                    cache_key = %cache_key,
                    error = %err,
                    "failed to write local cache entry"
                );
            }
        }

        let Some(remote) = &self.remote else {
            return;
        };
        if let Err(err) = remote.store(cache_key, &bytes) {
            tracing::warn!(
                target = "keel.cache",
                cache_key = %entry.cache_key,
                remote = %remote.describe(),
                error = %err,
                "failed to write remote cache entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &[u8], payload: &[u8]) -> CacheEntry {
        CacheEntry {
            cache_key: HashCode::of_bytes(key),
            origin: CacheOrigin {
                identity: "compile".to_string(),
                display_name: "Compile main".to_string(),
                execution_millis: 12,
                created_at_millis: 1,
            },
            outputs: BTreeMap::new(),
            packed: payload.to_vec(),
        }
    }

    fn set_age(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCacheStore::new(dir.path(), LocalCachePolicy::default());
        let entry = entry(b"k", b"payload");

        assert!(store.load(&entry.cache_key).is_none());
        store.store(&entry).unwrap();
        assert!(store.contains(&entry.cache_key));
        assert_eq!(store.load(&entry.cache_key), Some(entry));
    }

    #[test]
    fn entry_under_wrong_key_is_rejected() {
        let entry = entry(b"k", b"payload");
        let bytes = entry.to_bytes().unwrap();
        let other = HashCode::of_bytes(b"other");
        assert!(CacheEntry::from_bytes(&other, &bytes).is_err());
        assert_eq!(CacheEntry::from_bytes(&entry.cache_key, &bytes).unwrap(), entry);
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCacheStore::new(dir.path(), LocalCachePolicy::default());
        let entry = entry(b"k", b"payload bytes that will be damaged");
        store.store(&entry).unwrap();

        let path = store.entry_path(&entry.cache_key);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&path, bytes).unwrap();

        assert!(store.load(&entry.cache_key).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn gc_drops_expired_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalCacheStore::new(
            dir.path(),
            LocalCachePolicy {
                max_bytes: u64::MAX,
                max_age: Duration::from_secs(3600),
                ..LocalCachePolicy::default()
            },
        );
        let fresh = entry(b"fresh", b"1");
        let old = entry(b"old", b"2");
        store.store(&fresh).unwrap();
        store.store(&old).unwrap();
        set_age(&store.entry_path(&old.cache_key), Duration::from_secs(7200));

        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let stale_tmp = dir.path().join("abc.bin.tmp.1.1");
        std::fs::write(&stale_tmp, b"x").unwrap();
        set_age(&stale_tmp, Duration::from_secs(600));
        let garbage = dir.path().join(format!("{}.bin", HashCode::of_bytes(b"g")));
        std::fs::write(&garbage, b"garbage!garbage!").unwrap();

        let stats = store.gc().unwrap();
        assert_eq!(stats.removed_entries, 4);
        assert!(store.contains(&fresh.cache_key));
        assert!(!store.contains(&old.cache_key));
        assert!(!stale_tmp.exists());
        assert!(!garbage.exists());
    }

    #[test]
    fn gc_evicts_least_recently_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<_> = (0..3u8).map(|i| entry(&[i], &[i; 256])).collect();
        let unbounded = LocalCacheStore::new(dir.path(), LocalCachePolicy::default());
        for (i, entry) in entries.iter().enumerate() {
            unbounded.store(entry).unwrap();
            set_age(
                &unbounded.entry_path(&entry.cache_key),
                Duration::from_secs(100 - i as u64 * 10),
            );
        }
        // A hit makes the oldest entry the most recently used.
        assert!(unbounded.load(&entries[0].cache_key).is_some());

        let one_entry = std::fs::metadata(unbounded.entry_path(&entries[0].cache_key))
            .unwrap()
            .len();
        let bounded = LocalCacheStore::new(
            dir.path(),
            LocalCachePolicy {
                max_bytes: one_entry * 2,
                max_age: Duration::from_secs(3600),
                ..LocalCachePolicy::default()
            },
        );
        bounded.gc().unwrap();

        assert!(bounded.contains(&entries[0].cache_key));
        assert!(!bounded.contains(&entries[1].cache_key));
        assert!(bounded.contains(&entries[2].cache_key));
    }

    #[test]
    fn build_cache_without_remote_uses_local_tier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BuildCache::new(
            LocalCacheStore::new(dir.path(), LocalCachePolicy::default()),
            None,
        );
        let entry = entry(b"k", b"v");
        assert!(cache.load(&entry.cache_key).is_none());
        cache.store(&entry);
        assert_eq!(cache.load(&entry.cache_key), Some(entry));
        assert!(cache.remote().is_none());
    }

    #[test]
    fn entries_over_the_size_limit_are_written_nowhere() {
        let dir = tempfile::tempdir().unwrap();
        let policy = LocalCachePolicy {
            max_entry_bytes: 1024,
            ..LocalCachePolicy::default()
        };
        let remote = Arc::new(crate::remote::DirectoryRemoteCache::new(dir.path().join("remote")));
        let cache = BuildCache::new(
            LocalCacheStore::new(dir.path().join("local"), policy),
            Some(remote.clone()),
        );

        let large = entry(b"large", &[7u8; 4096]);
        let err = cache.local().store(&large).unwrap_err();
        assert!(matches!(err, CacheError::EntryTooLarge { limit: 1024, .. }), "{err}");

        cache.store(&large);
        assert!(!cache.local().contains(&large.cache_key));
        assert!(remote.load(&large.cache_key).unwrap().is_none());

        let small = entry(b"small", b"fits");
        cache.store(&small);
        assert!(cache.local().contains(&small.cache_key));
        assert!(remote.load(&small.cache_key).unwrap().is_some());
    }

    #[test]
    fn entry_limit_never_exceeds_the_readable_size() {
        let policy = LocalCachePolicy {
            max_entry_bytes: usize::MAX,
            ..LocalCachePolicy::default()
        };
        assert_eq!(policy.entry_limit(), BINCODE_PAYLOAD_LIMIT_BYTES);
    }
}
