//! Identity and cache-key derivation, and input fingerprinting.

use crate::error::{ExecutionError, Result};
use crate::unit::{InputValue, UnitOfWork};
use keel_cache::{
    FileSnapshotter, FileSystemSnapshot, Fingerprinter, HashCode, Hasher, RootedSnapshot,
};

/// Fingerprints of input properties, in declaration order.
pub type InputFingerprints = Vec<(String, HashCode)>;

/// The unit's declared identity or, when absent, one derived from its name
/// and the names of its identity inputs.
///
/// Never depends on paths, input values, or the current process.
pub fn derive_identity(unit: &UnitOfWork) -> String {
    if let Some(identity) = unit.declared_identity() {
        return identity.to_string();
    }
    let mut hasher = Hasher::new();
    hasher
        .put_str(unit.name())
        .put_u64(unit.identity_inputs().len() as u64);
    for (property, _) in unit.identity_inputs() {
        hasher.put_str(property);
    }
    let hash = hasher.finish().to_hex();
    format!("{}-{}", unit.name(), &hash[..16])
}

/// Hash of the ordered `(property, fingerprint)` pairs and the implementation
/// version. Reordering the pairs changes the key.
pub fn derive_cache_key(
    identity_fingerprints: &[(String, HashCode)],
    implementation_version: &str,
) -> HashCode {
    let mut hasher = Hasher::new();
    hasher.put_u64(identity_fingerprints.len() as u64);
    for (property, fingerprint) in identity_fingerprints {
        hasher.put_str(property).put_hash(fingerprint);
    }
    hasher.put_str(implementation_version);
    hasher.finish()
}

/// Fingerprints every property in `inputs`, failing on unreadable or
/// missing (non-optional) file roots.
pub fn fingerprint_inputs(
    unit: &UnitOfWork,
    inputs: &[(String, InputValue)],
    snapshotter: &FileSnapshotter,
) -> Result<InputFingerprints> {
    inputs
        .iter()
        .map(|(property, value)| {
            let fingerprint = match value {
                InputValue::Scalar(scalar) => Fingerprinter::fingerprint_scalar(scalar),
                InputValue::Files(files) => {
                    let collection = snapshotter.snapshot_collection(&files.paths).map_err(
                        |source| ExecutionError::Input {
                            unit: unit.display_name().to_string(),
                            property: property.clone(),
                            source,
                        },
                    )?;
                    if !files.optional {
                        if let Some(RootedSnapshot { absolute_path, .. }) = collection
                            .roots
                            .iter()
                            .find(|root| root.snapshot == FileSystemSnapshot::Missing)
                        {
                            return Err(ExecutionError::MissingInput {
                                unit: unit.display_name().to_string(),
                                property: property.clone(),
                                path: absolute_path.clone(),
                            });
                        }
                    }
                    Fingerprinter::fingerprint_files(
                        &collection,
                        files.normalization,
                        files.directories,
                    )
                }
            };
            Ok((property.clone(), fingerprint))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;
    use crate::unit::{ActionContext, FileInput};
    use keel_cache::NormalizationStrategy;

    fn noop(_: &ActionContext<'_>) -> std::result::Result<(), ActionError> {
        Ok(())
    }

    fn key(pairs: &[(&str, &[u8])], version: &str) -> HashCode {
        let pairs: Vec<_> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), HashCode::of_bytes(value)))
            .collect();
        derive_cache_key(&pairs, version)
    }

    #[test]
    fn cache_key_is_a_pure_function() {
        assert_eq!(
            key(&[("a", b"1"), ("b", b"2")], "v1"),
            key(&[("a", b"1"), ("b", b"2")], "v1")
        );
    }

    #[test]
    fn cache_key_depends_on_order_values_and_version() {
        let base = key(&[("a", b"1"), ("b", b"2")], "v1");
        assert_ne!(base, key(&[("b", b"2"), ("a", b"1")], "v1"));
        assert_ne!(base, key(&[("a", b"1"), ("b", b"3")], "v1"));
        assert_ne!(base, key(&[("a", b"1"), ("b", b"2")], "v2"));
        assert_ne!(key(&[("ab", b"1")], ""), key(&[("a", b"1")], "b"));
    }

    #[test]
    fn declared_identity_wins() {
        let unit = UnitOfWork::builder("compile")
            .identity(":app:compileJava")
            .action(noop)
            .build()
            .unwrap();
        assert_eq!(derive_identity(&unit), ":app:compileJava");
    }

    #[test]
    fn derived_identity_ignores_input_values() {
        let build = |value: &str| {
            UnitOfWork::builder("compile")
                .identity_input("source", value)
                .action(noop)
                .build()
                .unwrap()
        };
        assert_eq!(derive_identity(&build("a")), derive_identity(&build("b")));
        assert!(derive_identity(&build("a")).starts_with("compile-"));

        let renamed = UnitOfWork::builder("compile")
            .identity_input("sources", "a")
            .action(noop)
            .build()
            .unwrap();
        assert_ne!(derive_identity(&build("a")), derive_identity(&renamed));
    }

    #[test]
    fn missing_inputs_fail_unless_optional() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let required = FileInput::new([&missing], NormalizationStrategy::AbsolutePath);
        let unit = UnitOfWork::builder("compile")
            .identity_input("source", required.clone())
            .action(noop)
            .build()
            .unwrap();
        let snapshotter = FileSnapshotter::new(false);

        let err = fingerprint_inputs(&unit, unit.identity_inputs(), &snapshotter).unwrap_err();
        assert!(matches!(err, ExecutionError::MissingInput { .. }), "{err}");

        let optional = UnitOfWork::builder("compile")
            .identity_input("source", required.optional())
            .action(noop)
            .build()
            .unwrap();
        let fingerprints =
            fingerprint_inputs(&optional, optional.identity_inputs(), &snapshotter).unwrap();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].0, "source");
    }
}
