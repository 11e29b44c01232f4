use crate::error::{CacheError, Result};
use crate::util::{atomic_write, now_millis, remove_file_best_effort};
use fs2::FileExt as _;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::Duration;

/// A short-lived exclusive lock on a file, safe across threads and processes.
///
/// Used to serialize the read-modify-write of a [`HeartbeatLock`] owner
/// record. The lock is released when the value is dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    // `fs2` locks are process-scoped on unix, so threads of one process are
    // excluded by this mutex instead.
    _guard: MutexGuard<'static, ()>,
}

impl FileLock {
    /// Blocks until the lock on `path` is held, creating the file if needed.
    pub fn lock_exclusive(path: &Path) -> Result<Self> {
        let guard = process_lock_for_path(path).lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| CacheError::io_at(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| CacheError::io_at(path, err))?;
        file.lock_exclusive()
            .map_err(|err| CacheError::io_at(path, err))?;

        Ok(Self {
            file,
            _guard: guard,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let mut map = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    if let Some(existing) = map.get(path) {
        return existing;
    }
    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

/// Timings for [`HeartbeatLock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    /// A holder whose last heartbeat is older than this is presumed dead.
    pub stale_after: Duration,
    pub heartbeat_interval: Duration,
    /// How often a blocked acquirer re-checks a lock held by another process.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Contents of a held lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub token: String,
    pub acquired_at_millis: u64,
    pub heartbeat_millis: u64,
}

impl LockOwner {
    /// Reads the owner record at `path`; `None` when absent or unparsable.
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec(self)?)
    }
}

/// An exclusive lock identified by a file path, held until dropped.
///
/// Within a process, acquirers of the same path queue on a condition
/// variable. Across processes, the lock file records the holder's pid and a
/// heartbeat refreshed by a background thread; a holder whose heartbeat is
/// older than [`LockOptions::stale_after`] is treated as crashed and its lock
/// is broken.
#[derive(Debug)]
pub struct HeartbeatLock {
    path: PathBuf,
    token: String,
    heartbeat: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl HeartbeatLock {
    pub fn acquire(path: &Path, options: LockOptions) -> Result<Self> {
        let path = path.to_path_buf();
        hold_in_process(&path);
        match acquire_cross_process(&path, options) {
            Ok(token) => {
                let heartbeat = spawn_heartbeat(&path, &token, options.heartbeat_interval);
                Ok(Self {
                    path,
                    token,
                    heartbeat,
                })
            }
            Err(err) => {
                release_in_process(&path);
                Err(err)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HeartbeatLock {
    fn drop(&mut self) {
        if let Some((stop, handle)) = self.heartbeat.take() {
            drop(stop);
            let _ = handle.join();
        }
        match FileLock::lock_exclusive(&guard_path(&self.path)) {
            Ok(_guard) => {
                let owned = LockOwner::read(&self.path).is_some_and(|owner| owner.token == self.token);
                if owned {
                    remove_file_best_effort(&self.path, "lock.release");
                } else {
                    tracing::warn!(
                        target = "keel.cache",
                        path = %self.path.display(),
                        "lock was taken over by another holder before release"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    path = %self.path.display(),
                    error = %err,
                    "failed to lock owner record for release; leaving it to go stale"
                );
            }
        }
        release_in_process(&self.path);
    }
}

type Held = (Mutex<HashSet<PathBuf>>, Condvar);

fn held() -> &'static Held {
    static HELD: OnceLock<Held> = OnceLock::new();
    HELD.get_or_init(|| (Mutex::new(HashSet::new()), Condvar::new()))
}

fn hold_in_process(path: &Path) {
    let (set, released) = held();
    let mut set = set.lock();
    while set.contains(path) {
        released.wait(&mut set);
    }
    set.insert(path.to_path_buf());
}

fn release_in_process(path: &Path) {
    let (set, released) = held();
    set.lock().remove(path);
    released.notify_all();
}

fn guard_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".guard");
    path.with_file_name(name)
}

fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!(
        "{}-{}-{}",
        std::process::id(),
        now_millis(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn acquire_cross_process(path: &Path, options: LockOptions) -> Result<String> {
    let guard_path = guard_path(path);
    let stale_after = options.stale_after.as_millis() as u64;
    let mut waiting_on = None;

    loop {
        {
            let _guard = FileLock::lock_exclusive(&guard_path)?;
            let now = now_millis();
            let takeover = match std::fs::metadata(path) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
                Err(err) => return Err(CacheError::io_at(path, err)),
                Ok(meta) => match LockOwner::read(path) {
                    Some(owner) => {
                        let silent_for = now.saturating_sub(owner.heartbeat_millis);
                        if silent_for > stale_after {
                            tracing::warn!(
                                target = "keel.cache",
                                path = %path.display(),
                                holder_pid = owner.pid,
                                silent_for_ms = silent_for,
                                "breaking stale lock"
                            );
                            true
                        } else {
                            if waiting_on.as_ref() != Some(&owner.token) {
                                tracing::debug!(
                                    target = "keel.cache",
                                    path = %path.display(),
                                    holder_pid = owner.pid,
                                    "waiting for lock held by another process"
                                );
                                waiting_on = Some(owner.token);
                            }
                            false
                        }
                    }
                    None => {
                        // Unparsable owner record. Writes are atomic, so this is
                        // not a half-written record; give it the same grace
                        // period as a live holder before breaking it.
                        let age = meta
                            .modified()
                            .ok()
                            .and_then(|modified| modified.elapsed().ok())
                            .map_or(0, |elapsed| elapsed.as_millis() as u64);
                        if age > stale_after {
                            tracing::warn!(
                                target = "keel.cache",
                                path = %path.display(),
                                "breaking unreadable lock file"
                            );
                        }
                        age > stale_after
                    }
                },
            };

            if takeover {
                let token = new_token();
                LockOwner {
                    pid: std::process::id(),
                    token: token.clone(),
                    acquired_at_millis: now,
                    heartbeat_millis: now,
                }
                .write(path)?;
                return Ok(token);
            }
        }
        std::thread::sleep(options.poll_interval);
    }
}

fn spawn_heartbeat(
    path: &Path,
    token: &str,
    interval: Duration,
) -> Option<(mpsc::Sender<()>, JoinHandle<()>)> {
    let (stop, stopped) = mpsc::channel::<()>();
    let path = path.to_path_buf();
    let token = token.to_string();
    let spawned = std::thread::Builder::new()
        .name("keel-lock-heartbeat".to_string())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !beat(&path, &token) {
                        return;
                    }
                }
                _ => return,
            }
        });
    match spawned {
        Ok(handle) => Some((stop, handle)),
        Err(err) => {
            tracing::warn!(
                target = "keel.cache",
                error = %err,
                "failed to spawn lock heartbeat thread; lock may be broken as stale"
            );
            None
        }
    }
}

/// Refreshes the heartbeat. Returns `false` once the lock is no longer ours.
fn beat(path: &Path, token: &str) -> bool {
    let result = FileLock::lock_exclusive(&guard_path(path)).and_then(|_guard| {
        match LockOwner::read(path) {
            Some(mut owner) if owner.token == token => {
                owner.heartbeat_millis = now_millis();
                owner.write(path).map(|()| true)
            }
            _ => Ok(false),
        }
    });
    match result {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(
                target = "keel.cache",
                path = %path.display(),
                "lost lock ownership; stopping heartbeat"
            );
            false
        }
        Err(err) => {
            tracing::debug!(
                target = "keel.cache",
                path = %path.display(),
                error = %err,
                "failed to refresh lock heartbeat"
            );
            true
        }
    }
}
