use crate::error::{CacheError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound for any persisted record we are willing to decode.
///
/// A corrupted length prefix must degrade to a miss, not to a huge allocation.
pub const BINCODE_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "keel.cache",
                    error = %err,
                    "system clock is before the unix epoch; using 0 as the current time"
                );
            }
            0
        }
    }
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options()
        .with_limit(BINCODE_PAYLOAD_LIMIT_BYTES as u64)
        .deserialize(bytes)?)
}

/// Reads a persisted record, returning `None` for anything that is not a
/// plain file within the size limit.
///
/// Missing files are the common case (a miss) and are not logged.
pub(crate) fn read_file_limited(path: &Path) -> Option<Vec<u8>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "keel.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat persisted record"
                );
            }
            return None;
        }
    };
    if !meta.is_file() || meta.len() > BINCODE_PAYLOAD_LIMIT_BYTES as u64 {
        tracing::debug!(
            target = "keel.cache",
            path = %path.display(),
            len = meta.len(),
            "ignoring persisted record that is not a regular file within the size limit"
        );
        return None;
    }

    match fs::read(path) {
        Ok(bytes) if bytes.len() <= BINCODE_PAYLOAD_LIMIT_BYTES => Some(bytes),
        Ok(_) => None,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "keel.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to read persisted record"
                );
            }
            None
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "keel.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

/// Removes whatever exists at `path` (file, symlink, or directory tree).
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CacheError::io_at(path, err)),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CacheError::io_at(path, err)),
    }
}

/// Writes `bytes` to `path` so that readers observe either the previous file
/// or the complete new one, never a partial write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    atomic_write_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<()>,
) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(&parent).map_err(|err| CacheError::io_at(&parent, err))?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, &parent)?;
    let written = write(&mut file).and_then(|()| file.sync_all().map_err(CacheError::from));
    drop(file);
    if let Err(err) = written {
        remove_file_best_effort(&tmp_path, "atomic_write.write_failed");
        return Err(err);
    }

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_file_best_effort(&tmp_path, "atomic_write.rename_failed");
        return Err(CacheError::io_at(path, err));
    }

    sync_dir_best_effort(&parent);
    Ok(())
}

/// Unique sibling path for staging a write next to `dest`.
pub(crate) fn unique_sibling(dest: &Path, tag: &str) -> Result<PathBuf> {
    let parent = parent_dir(dest)?;
    let name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut tmp_name = name.to_os_string();
    tmp_name.push(format!(".{tag}.{}.{counter}", std::process::id()));
    Ok(parent.join(tmp_name))
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("path has no parent"))?;
    Ok(if parent.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        parent.to_path_buf()
    })
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> Result<(PathBuf, fs::File)> {
    loop {
        let tmp_path = unique_sibling(dest, "tmp")?;
        debug_assert_eq!(tmp_path.parent(), Some(parent));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(CacheError::io_at(tmp_path, err)),
        }
    }
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    // `rename` replaces atomically on unix. Windows refuses to overwrite, so
    // concurrent writers retry remove + rename until one of them wins.
    const MAX_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err) if cfg!(windows) && attempts < MAX_ATTEMPTS && to.exists() => {
                attempts += 1;
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(_) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        static REPORTED: OnceLock<()> = OnceLock::new();
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target = "keel.cache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

/// Whether a file name looks like a leftover from [`atomic_write`].
pub(crate) fn is_tmp_file_name(name: &str) -> bool {
    name.contains(".tmp.")
}
