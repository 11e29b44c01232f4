//! Immutable file-system snapshots.
//!
//! A [`FileSystemSnapshot`] records the kind, content hash, and length of every
//! node under a root. It deliberately does not record where the root lives, so
//! two snapshots compare equal whenever their trees are structurally and
//! content-identical. [`RootedSnapshot`] pairs a snapshot with its absolute
//! location for the normalizations that care about it.

use crate::error::{CacheError, Result};
use crate::hash::HashCode;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSystemSnapshot {
    Missing,
    RegularFile {
        content_hash: HashCode,
        length: u64,
    },
    /// Children sorted by name.
    Directory { children: Vec<(String, FileSystemSnapshot)> },
}

impl FileSystemSnapshot {
    pub fn is_missing(&self) -> bool {
        matches!(self, FileSystemSnapshot::Missing)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, FileSystemSnapshot::Directory { .. })
    }

    /// A missing path or a directory without any descendants.
    pub fn is_empty(&self) -> bool {
        match self {
            FileSystemSnapshot::Missing => true,
            FileSystemSnapshot::RegularFile { .. } => false,
            FileSystemSnapshot::Directory { children } => children.is_empty(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&FileSystemSnapshot> {
        match self {
            FileSystemSnapshot::Directory { children } => children
                .binary_search_by(|(child, _)| child.as_str().cmp(name))
                .ok()
                .map(|idx| &children[idx].1),
            _ => None,
        }
    }

    /// Visits every node depth-first in name order, passing the path relative
    /// to this snapshot's root (`""` for the root itself).
    pub fn visit(&self, visitor: &mut impl FnMut(&str, &FileSystemSnapshot)) {
        fn walk(
            prefix: &mut String,
            node: &FileSystemSnapshot,
            visitor: &mut impl FnMut(&str, &FileSystemSnapshot),
        ) {
            visitor(prefix, node);
            if let FileSystemSnapshot::Directory { children } = node {
                for (name, child) in children {
                    let restore = prefix.len();
                    if !prefix.is_empty() {
                        prefix.push('/');
                    }
                    prefix.push_str(name);
                    walk(prefix, child, visitor);
                    prefix.truncate(restore);
                }
            }
        }

        let mut prefix = String::new();
        walk(&mut prefix, self, visitor);
    }

    /// Relative paths of all regular files in this tree.
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.visit(&mut |path, node| {
            if let FileSystemSnapshot::RegularFile { .. } = node {
                paths.push(path.to_string());
            }
        });
        paths
    }

    /// Total number of bytes across all regular files.
    pub fn total_length(&self) -> u64 {
        let mut total = 0_u64;
        self.visit(&mut |_, node| {
            if let FileSystemSnapshot::RegularFile { length, .. } = node {
                total = total.saturating_add(*length);
            }
        });
        total
    }
}

/// A snapshot together with the absolute path it was taken at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootedSnapshot {
    pub absolute_path: PathBuf,
    pub snapshot: FileSystemSnapshot,
}

/// Snapshots of every root of a file collection, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileCollectionSnapshot {
    pub roots: Vec<RootedSnapshot>,
}

impl FileCollectionSnapshot {
    /// Whether the collection is non-empty and consists only of directory trees.
    pub fn is_file_tree_only(&self) -> bool {
        !self.roots.is_empty() && self.roots.iter().all(|root| root.snapshot.is_directory())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct HashCacheKey {
    path: PathBuf,
    length: u64,
    modified_nanos: u128,
}

/// Remembers content hashes keyed by `(path, length, mtime)`.
///
/// This only avoids re-reading files; a changed length or mtime always forces
/// a re-hash. Content that changes while both stay identical is not detected.
#[derive(Debug, Default)]
pub struct FileHashCache {
    entries: RwLock<HashMap<HashCacheKey, HashCode>>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn get(&self, key: &HashCacheKey) -> Option<HashCode> {
        self.entries.read().get(key).copied()
    }

    fn insert(&self, key: HashCacheKey, hash: HashCode) {
        self.entries
            .write()
            .insert(key, hash);
    }
}

/// Walks paths into [`FileSystemSnapshot`]s.
///
/// Construct one per process and share it by reference; the optional
/// [`FileHashCache`] lives exactly as long as the snapshotter.
#[derive(Debug)]
pub struct FileSnapshotter {
    hash_cache: Option<FileHashCache>,
}

impl Default for FileSnapshotter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FileSnapshotter {
    /// `use_hash_cache = false` hashes every file on every snapshot.
    pub fn new(use_hash_cache: bool) -> Self {
        Self {
            hash_cache: use_hash_cache.then(FileHashCache::new),
        }
    }

    pub fn hash_cache(&self) -> Option<&FileHashCache> {
        self.hash_cache.as_ref()
    }

    pub fn snapshot(&self, path: &Path) -> Result<FileSystemSnapshot> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(FileSystemSnapshot::Missing)
            }
            Err(err) => return Err(CacheError::io_at(path, err)),
        };

        if !meta.is_dir() {
            return self.snapshot_file(path, &meta);
        }

        // Pre-order walk with children sorted by name. `open` holds the chain
        // of directories from the root down to the current entry's parent.
        let mut open: Vec<Vec<(String, FileSystemSnapshot)>> = vec![Vec::new()];
        let mut names: Vec<String> = Vec::new();
        let walker = walkdir::WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .min_depth(1);
        for entry in walker {
            let entry = entry?;
            let depth = entry.depth();
            while open.len() > depth {
                close_directory(&mut open, &mut names);
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_dir() {
                open.push(Vec::new());
                names.push(name);
            } else {
                let meta = entry.metadata()?;
                let node = self.snapshot_file(entry.path(), &meta)?;
                if let Some(children) = open.last_mut() {
                    children.push((name, node));
                }
            }
        }
        while open.len() > 1 {
            close_directory(&mut open, &mut names);
        }

        let mut children = open.pop().unwrap_or_default();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(FileSystemSnapshot::Directory { children })
    }

    pub fn snapshot_rooted(&self, path: &Path) -> Result<RootedSnapshot> {
        Ok(RootedSnapshot {
            absolute_path: absolute(path)?,
            snapshot: self.snapshot(path)?,
        })
    }

    pub fn snapshot_collection(&self, paths: &[PathBuf]) -> Result<FileCollectionSnapshot> {
        let roots = paths
            .iter()
            .map(|path| self.snapshot_rooted(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(FileCollectionSnapshot { roots })
    }

    fn snapshot_file(&self, path: &Path, meta: &std::fs::Metadata) -> Result<FileSystemSnapshot> {
        let length = meta.len();
        let key = self.hash_cache.as_ref().map(|_| HashCacheKey {
            path: path.to_path_buf(),
            length,
            modified_nanos: modified_nanos(meta),
        });

        if let (Some(cache), Some(key)) = (&self.hash_cache, &key) {
            if let Some(content_hash) = cache.get(key) {
                return Ok(FileSystemSnapshot::RegularFile {
                    content_hash,
                    length,
                });
            }
        }

        let content_hash = HashCode::of_file(path)?;
        if let (Some(cache), Some(key)) = (&self.hash_cache, key) {
            cache.insert(key, content_hash);
        }
        Ok(FileSystemSnapshot::RegularFile {
            content_hash,
            length,
        })
    }
}

fn close_directory(open: &mut Vec<Vec<(String, FileSystemSnapshot)>>, names: &mut Vec<String>) {
    let (Some(mut children), Some(name)) = (open.pop(), names.pop()) else {
        return;
    };
    children.sort_by(|a, b| a.0.cmp(&b.0));
    if let Some(parent) = open.last_mut() {
        parent.push((name, FileSystemSnapshot::Directory { children }));
    }
}

fn modified_nanos(meta: &std::fs::Metadata) -> u128 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path))
}
