use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// A 256-bit SHA-256 digest.
///
/// Displayed (and parsed) as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashCode([u8; 32]);

impl HashCode {
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of an arbitrary byte slice.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(bytes.as_ref()).into())
    }

    /// SHA-256 of everything readable from `reader`, streamed in 64 KiB chunks.
    pub fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    pub fn of_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|err| CacheError::io_at(path, err))?;
        Self::of_reader(file).map_err(|err| CacheError::io_at(path, err))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.to_hex())
    }
}

impl FromStr for HashCode {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0_u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// Incremental hasher for composite values.
///
/// Every `put_*` call writes a one-byte type tag and, for variable-length
/// data, a length prefix, so `put_str("ab"); put_str("c")` never collides
/// with `put_str("a"); put_str("bc")`.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update([b'b']);
        self.inner.update((bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.inner.update([b's']);
        self.inner.update((value.len() as u64).to_le_bytes());
        self.inner.update(value.as_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update([b'u']);
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.inner.update([b'i']);
        self.inner.update(value.to_le_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.inner.update([b'z', u8::from(value)]);
        self
    }

    pub fn put_hash(&mut self, value: &HashCode) -> &mut Self {
        self.inner.update([b'h']);
        self.inner.update(value.as_bytes());
        self
    }

    /// Marks a structural boundary (e.g. "no value here", end of a list).
    pub fn put_marker(&mut self, marker: u8) -> &mut Self {
        self.inner.update([b'm', marker]);
        self
    }

    pub fn finish(self) -> HashCode {
        HashCode(self.inner.finalize().into())
    }
}
