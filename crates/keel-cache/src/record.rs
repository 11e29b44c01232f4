//! Self-describing, checksummed envelope shared by the persisted stores.

use crate::error::{CacheError, Result};
use crate::hash::HashCode;
use crate::util::{bincode_deserialize, bincode_serialize};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    magic: [u8; 8],
    format_version: u32,
    keel_version: &'a str,
    checksum: HashCode,
    payload: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct EnvelopeOwned {
    magic: [u8; 8],
    format_version: u32,
    keel_version: String,
    checksum: HashCode,
    payload: Vec<u8>,
}

/// Which record family an envelope belongs to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RecordKind {
    pub magic: [u8; 8],
    pub format_version: u32,
    pub what: &'static str,
}

pub(crate) fn encode<T: Serialize>(kind: RecordKind, value: &T) -> Result<Vec<u8>> {
    let payload = bincode_serialize(value)?;
    bincode_serialize(&Envelope {
        magic: kind.magic,
        format_version: kind.format_version,
        keel_version: crate::KEEL_VERSION,
        checksum: HashCode::of_bytes(&payload),
        payload: &payload,
    })
}

/// Length of the fixed prefix checked by [`has_header`].
pub(crate) const HEADER_LEN: usize = 12;

/// Cheap check of the magic bytes and format version without reading the
/// payload. Used by GC to spot foreign or outdated files.
pub(crate) fn has_header(kind: RecordKind, prefix: &[u8]) -> bool {
    prefix.len() >= HEADER_LEN
        && prefix[..8] == kind.magic
        && prefix[8..HEADER_LEN] == kind.format_version.to_le_bytes()
}

/// Decodes and verifies an envelope.
///
/// Callers that must stay fail-safe convert the error into a miss.
pub(crate) fn decode<T: for<'de> Deserialize<'de>>(kind: RecordKind, bytes: &[u8]) -> Result<T> {
    let envelope: EnvelopeOwned = bincode_deserialize(bytes)?;
    if envelope.magic != kind.magic {
        return Err(CacheError::InvalidRecord {
            path: kind.what.into(),
            reason: "unexpected magic bytes".to_string(),
        });
    }
    if envelope.format_version != kind.format_version {
        return Err(CacheError::IncompatibleFormatVersion {
            expected: kind.format_version,
            found: envelope.format_version,
        });
    }
    if envelope.keel_version != crate::KEEL_VERSION {
        return Err(CacheError::InvalidRecord {
            path: kind.what.into(),
            reason: format!("written by keel {}", envelope.keel_version),
        });
    }
    let found = HashCode::of_bytes(&envelope.payload);
    if found != envelope.checksum {
        return Err(CacheError::ChecksumMismatch {
            what: kind.what.to_string(),
            expected: envelope.checksum.to_hex(),
            found: found.to_hex(),
        });
    }
    bincode_deserialize(&envelope.payload)
}
