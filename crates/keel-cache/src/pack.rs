//! Packing declared outputs into a single `tar.zst` blob and restoring them.
//!
//! Archive entry names are `<index>` (a file output) or `<index>/<relative>`
//! (a file inside a directory output), where `<index>` is the output's
//! position in name order. Directories are not archived: they are recreated
//! from the recorded snapshots, which also covers empty directories.

use crate::error::{CacheError, Result};
use crate::snapshot::FileSystemSnapshot;
use crate::util::remove_path;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;

const ZSTD_LEVEL: i32 = 3;

pub fn pack_outputs(
    locations: &BTreeMap<String, PathBuf>,
    snapshots: &BTreeMap<String, FileSystemSnapshot>,
) -> Result<Vec<u8>> {
    let encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for (index, (name, snapshot)) in snapshots.iter().enumerate() {
        let location = locations
            .get(name)
            .ok_or_else(|| CacheError::InvalidArchivePath {
                path: PathBuf::from(name),
            })?;
        let mut failure = None;
        snapshot.visit(&mut |relative, node| {
            if failure.is_some() {
                return;
            }
            if let FileSystemSnapshot::RegularFile { .. } = node {
                let (disk_path, archive_name) = if relative.is_empty() {
                    (location.clone(), index.to_string())
                } else {
                    (location.join(relative), format!("{index}/{relative}"))
                };
                if let Err(err) = builder.append_path_with_name(&disk_path, &archive_name) {
                    failure = Some(CacheError::io_at(disk_path, err));
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Replaces every declared output location with the archived content.
///
/// The caller verifies the result against `snapshots`; this function only
/// guarantees that nothing is written outside the declared locations.
pub fn unpack_outputs(
    bytes: &[u8],
    locations: &BTreeMap<String, PathBuf>,
    snapshots: &BTreeMap<String, FileSystemSnapshot>,
) -> Result<()> {
    let mut roots = Vec::with_capacity(snapshots.len());
    for (name, snapshot) in snapshots {
        let location = locations
            .get(name)
            .ok_or_else(|| CacheError::InvalidArchivePath {
                path: PathBuf::from(name),
            })?;
        remove_path(location)?;
        prepare_layout(location, snapshot)?;
        roots.push(location.clone());
    }

    let decoder = zstd::Decoder::new(Cursor::new(bytes))?;
    let mut archive = tar::Archive::new(decoder);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let (index, relative) = split_archive_path(&entry_path)?;
        let root = roots
            .get(index)
            .ok_or_else(|| CacheError::UnexpectedArchiveEntry {
                path: entry_path.clone(),
            })?;

        match entry.header().entry_type() {
            EntryType::Regular => {}
            EntryType::Directory => continue,
            _ => return Err(CacheError::UnsupportedArchiveEntryType { path: entry_path }),
        }

        let dest = if relative.as_os_str().is_empty() {
            root.clone()
        } else {
            root.join(&relative)
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|err| CacheError::io_at(parent, err))?;
        }
        let mut out = File::create(&dest).map_err(|err| CacheError::io_at(&dest, err))?;
        io::copy(&mut entry, &mut out).map_err(|err| CacheError::io_at(&dest, err))?;
        if let Ok(mode) = entry.header().mode() {
            set_mode_best_effort(&dest, mode);
        }
    }
    Ok(())
}

fn prepare_layout(location: &Path, snapshot: &FileSystemSnapshot) -> Result<()> {
    let mut failure = None;
    snapshot.visit(&mut |relative, node| {
        if failure.is_some() {
            return;
        }
        let target = if relative.is_empty() {
            location.to_path_buf()
        } else {
            location.join(relative)
        };
        let dir = match node {
            FileSystemSnapshot::Directory { .. } => Some(target.as_path()),
            FileSystemSnapshot::RegularFile { .. } => target.parent(),
            FileSystemSnapshot::Missing => None,
        };
        if let Some(dir) = dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                failure = Some(CacheError::io_at(dir, err));
            }
        }
    });
    failure.map_or(Ok(()), Err)
}

/// Splits `<index>[/<relative>]`, rejecting anything that could escape the
/// output it belongs to.
fn split_archive_path(path: &Path) -> Result<(usize, PathBuf)> {
    let invalid = || CacheError::InvalidArchivePath {
        path: path.to_path_buf(),
    };
    let mut components = path.components();
    let index = match components.next() {
        Some(Component::Normal(first)) => first
            .to_str()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };

    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(invalid()),
        }
    }
    Ok((index, relative))
}

#[cfg(unix)]
fn set_mode_best_effort(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt as _;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777));
}

#[cfg(not(unix))]
fn set_mode_best_effort(_path: &Path, _mode: u32) {}
