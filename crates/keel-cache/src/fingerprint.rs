//! Normalized fingerprints of scalar values and file collections.

use crate::hash::{HashCode, Hasher};
use crate::snapshot::{FileCollectionSnapshot, FileSystemSnapshot, RootedSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// How much of a file's location contributes to its fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NormalizationStrategy {
    /// Absolute path and content.
    AbsolutePath,
    /// Path relative to the declared root, and content.
    RelativePath,
    /// File name and content.
    NameOnly,
    /// Content only.
    ContentOnly,
}

/// Whether directories themselves take part in a file fingerprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectorySensitivity {
    /// Directories and missing roots are fingerprinted; an empty directory and
    /// a missing path differ.
    #[default]
    Default,
    /// Only regular files are fingerprinted; an empty directory and a missing
    /// path are equivalent.
    IgnoreDirectories,
}

/// A scalar input value with a deterministic hash encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Hash(HashCode),
    List(Vec<ScalarValue>),
}

impl ScalarValue {
    fn append_to(&self, hasher: &mut Hasher) {
        match self {
            ScalarValue::Null => {
                hasher.put_marker(0);
            }
            ScalarValue::Bool(value) => {
                hasher.put_marker(1).put_bool(*value);
            }
            ScalarValue::Int(value) => {
                hasher.put_marker(2).put_i64(*value);
            }
            ScalarValue::Str(value) => {
                hasher.put_marker(3).put_str(value);
            }
            ScalarValue::Hash(value) => {
                hasher.put_marker(4).put_hash(value);
            }
            ScalarValue::List(values) => {
                hasher.put_marker(5).put_u64(values.len() as u64);
                for value in values {
                    value.append_to(hasher);
                }
            }
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Int(value)
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<HashCode> for ScalarValue {
    fn from(value: HashCode) -> Self {
        ScalarValue::Hash(value)
    }
}

const KIND_MISSING: u8 = b'M';
const KIND_DIRECTORY: u8 = b'D';
const KIND_FILE: u8 = b'F';

/// Stateless folding of values into fingerprint hashes.
///
/// The result depends only on the value and the requested normalization,
/// never on file-system iteration order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    pub fn fingerprint_scalar(value: &ScalarValue) -> HashCode {
        let mut hasher = Hasher::new();
        hasher.put_str("scalar");
        value.append_to(&mut hasher);
        hasher.finish()
    }

    pub fn fingerprint_files(
        collection: &FileCollectionSnapshot,
        normalization: NormalizationStrategy,
        directories: DirectorySensitivity,
    ) -> HashCode {
        let mut hasher = Hasher::new();
        hasher.put_str("files");
        hasher.put_u64(collection.roots.len() as u64);
        for root in &collection.roots {
            let mut entries = normalized_entries(root, normalization, directories);
            if matches!(
                normalization,
                NormalizationStrategy::NameOnly | NormalizationStrategy::ContentOnly
            ) {
                // Several files may normalize to the same key; only the
                // multiset of entries is meaningful.
                entries.sort();
            }
            hasher.put_u64(entries.len() as u64);
            for (path, kind, hash) in &entries {
                hasher.put_str(path).put_marker(*kind);
                if let Some(hash) = hash {
                    hasher.put_hash(hash);
                }
            }
        }
        hasher.finish()
    }
}

type Entry = (String, u8, Option<HashCode>);

fn normalized_entries(
    root: &RootedSnapshot,
    normalization: NormalizationStrategy,
    directories: DirectorySensitivity,
) -> Vec<Entry> {
    let root_name = root
        .absolute_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let root_is_dir = root.snapshot.is_directory();

    let mut entries = Vec::new();
    root.snapshot.visit(&mut |relative, node| {
        let (kind, hash) = match node {
            FileSystemSnapshot::Missing => (KIND_MISSING, None),
            FileSystemSnapshot::Directory { .. } => (KIND_DIRECTORY, None),
            FileSystemSnapshot::RegularFile { content_hash, .. } => {
                (KIND_FILE, Some(*content_hash))
            }
        };
        if kind != KIND_FILE && directories == DirectorySensitivity::IgnoreDirectories {
            return;
        }

        let is_root = relative.is_empty();
        let path = match normalization {
            NormalizationStrategy::AbsolutePath => {
                if is_root {
                    path_string(&root.absolute_path)
                } else {
                    path_string(&root.absolute_path.join(relative))
                }
            }
            NormalizationStrategy::RelativePath => {
                if is_root && !root_is_dir {
                    root_name.clone()
                } else {
                    relative.to_string()
                }
            }
            NormalizationStrategy::NameOnly => {
                if is_root {
                    if root_is_dir {
                        String::new()
                    } else {
                        root_name.clone()
                    }
                } else {
                    relative
                        .rsplit('/')
                        .next()
                        .unwrap_or(relative)
                        .to_string()
                }
            }
            NormalizationStrategy::ContentOnly => {
                // Inner directories carry no content; the root's own kind is
                // still recorded so "missing" and "empty" stay distinct.
                if kind == KIND_DIRECTORY && !is_root {
                    return;
                }
                String::new()
            }
        };
        entries.push((path, kind, hash));
    });
    entries
}

fn path_string(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::Prefix(prefix) => out.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::CurDir => {}
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&other.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileSnapshotter;
    use std::fs;
    use std::path::PathBuf;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(root.join("pkg/A.txt"), "class A").unwrap();
        fs::write(root.join("B.txt"), "class B").unwrap();
    }

    fn fingerprint(
        paths: &[PathBuf],
        normalization: NormalizationStrategy,
        directories: DirectorySensitivity,
    ) -> HashCode {
        let snapshot = FileSnapshotter::new(false)
            .snapshot_collection(paths)
            .unwrap();
        Fingerprinter::fingerprint_files(&snapshot, normalization, directories)
    }

    #[test]
    fn relative_and_name_only_ignore_root_location() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("first/src");
        let b = dir.path().join("second/elsewhere");
        tree(&a);
        tree(&b);

        for normalization in [
            NormalizationStrategy::RelativePath,
            NormalizationStrategy::NameOnly,
            NormalizationStrategy::ContentOnly,
        ] {
            assert_eq!(
                fingerprint(&[a.clone()], normalization, DirectorySensitivity::Default),
                fingerprint(&[b.clone()], normalization, DirectorySensitivity::Default),
                "{normalization:?}"
            );
        }
        assert_ne!(
            fingerprint(
                &[a],
                NormalizationStrategy::AbsolutePath,
                DirectorySensitivity::Default
            ),
            fingerprint(
                &[b],
                NormalizationStrategy::AbsolutePath,
                DirectorySensitivity::Default
            ),
        );
    }

    #[test]
    fn relative_path_sees_moves_but_content_only_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::create_dir_all(a.join("x")).unwrap();
        fs::create_dir_all(b.join("y")).unwrap();
        fs::write(a.join("x/file.txt"), "same").unwrap();
        fs::write(b.join("y/file.txt"), "same").unwrap();

        let rel = NormalizationStrategy::RelativePath;
        let name = NormalizationStrategy::NameOnly;
        let content = NormalizationStrategy::ContentOnly;
        let d = DirectorySensitivity::Default;
        assert_ne!(fingerprint(&[a.clone()], rel, d), fingerprint(&[b.clone()], rel, d));
        // Directory names differ, so name-only still sees the renamed directory.
        assert_ne!(fingerprint(&[a.clone()], name, d), fingerprint(&[b.clone()], name, d));
        assert_eq!(fingerprint(&[a], content, d), fingerprint(&[b], content, d));
    }

    #[test]
    fn content_change_changes_every_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        tree(&root);

        let strategies = [
            NormalizationStrategy::AbsolutePath,
            NormalizationStrategy::RelativePath,
            NormalizationStrategy::NameOnly,
            NormalizationStrategy::ContentOnly,
        ];
        let before: Vec<_> = strategies
            .iter()
            .map(|s| fingerprint(&[root.clone()], *s, DirectorySensitivity::Default))
            .collect();
        fs::write(root.join("pkg/A.txt"), "class A2").unwrap();
        let after: Vec<_> = strategies
            .iter()
            .map(|s| fingerprint(&[root.clone()], *s, DirectorySensitivity::Default))
            .collect();
        for (before, after) in before.iter().zip(&after) {
            assert_ne!(before, after);
        }
    }

    #[test]
    fn empty_directory_and_missing_path_differ_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let missing = dir.path().join("missing");

        for normalization in [
            NormalizationStrategy::RelativePath,
            NormalizationStrategy::NameOnly,
            NormalizationStrategy::ContentOnly,
        ] {
            assert_ne!(
                fingerprint(&[empty.clone()], normalization, DirectorySensitivity::Default),
                fingerprint(&[missing.clone()], normalization, DirectorySensitivity::Default),
                "{normalization:?}"
            );
            assert_eq!(
                fingerprint(
                    &[empty.clone()],
                    normalization,
                    DirectorySensitivity::IgnoreDirectories
                ),
                fingerprint(
                    &[missing.clone()],
                    normalization,
                    DirectorySensitivity::IgnoreDirectories
                ),
                "{normalization:?}"
            );
        }
    }

    #[test]
    fn fingerprints_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("src");
        tree(&root);
        let first = fingerprint(
            &[root.clone()],
            NormalizationStrategy::RelativePath,
            DirectorySensitivity::Default,
        );
        let second = fingerprint(
            &[root],
            NormalizationStrategy::RelativePath,
            DirectorySensitivity::Default,
        );
        assert_eq!(first, second);
    }

    #[test]
    fn scalar_fingerprints_distinguish_types_and_nesting() {
        let str_one = Fingerprinter::fingerprint_scalar(&ScalarValue::from("1"));
        let int_one = Fingerprinter::fingerprint_scalar(&ScalarValue::Int(1));
        assert_ne!(str_one, int_one);

        let nested = ScalarValue::List(vec![
            ScalarValue::List(vec!["a".into()]),
            "b".into(),
        ]);
        let flat = ScalarValue::List(vec!["a".into(), "b".into()]);
        assert_ne!(
            Fingerprinter::fingerprint_scalar(&nested),
            Fingerprinter::fingerprint_scalar(&flat)
        );
        assert_eq!(
            Fingerprinter::fingerprint_scalar(&flat),
            Fingerprinter::fingerprint_scalar(&flat.clone())
        );
    }
}
