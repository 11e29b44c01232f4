use crate::error::{CacheError, Result};
use crate::hash::HashCode;
use crate::util::{atomic_write, read_file_limited, BINCODE_PAYLOAD_LIMIT_BYTES};
use std::fmt;
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const URL_REDACTION: &str = "<redacted>";

/// A shared cache tier addressed by cache key.
///
/// Implementations move opaque, already-encoded entries; verification
/// happens in the caller.
pub trait RemoteCache: fmt::Debug + Send + Sync {
    /// `Ok(None)` is a plain miss.
    fn load(&self, cache_key: &HashCode) -> Result<Option<Vec<u8>>>;

    fn store(&self, cache_key: &HashCode, bytes: &[u8]) -> Result<()>;

    /// Human-readable location, safe to log.
    fn describe(&self) -> String;
}

/// Selects a remote tier for `url`.
///
/// `http://` and `https://` URLs use [`HttpRemoteCache`]; `file://` URLs and
/// plain paths use [`DirectoryRemoteCache`].
pub fn remote_cache_for_url(url: &str) -> Result<Arc<dyn RemoteCache>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Arc::new(HttpRemoteCache::new(url)));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Arc::new(DirectoryRemoteCache::new(path)));
    }
    if url.contains("://") || url.is_empty() {
        return Err(CacheError::UnsupportedRemoteUrl {
            url: sanitize_url(url),
        });
    }
    Ok(Arc::new(DirectoryRemoteCache::new(url)))
}

/// Remote tier served over HTTP: `GET`/`PUT <base>/<cache-key>`.
#[derive(Clone)]
pub struct HttpRemoteCache {
    base: String,
    agent: ureq::Agent,
}

impl fmt::Debug for HttpRemoteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteCache")
            .field("base", &sanitize_url(&self.base))
            .finish_non_exhaustive()
    }
}

impl HttpRemoteCache {
    pub fn new(base: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build();
        Self {
            base: base.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn entry_url(&self, cache_key: &HashCode) -> String {
        format!("{}/{cache_key}", self.base)
    }

    fn http_error(&self, err: ureq::Error) -> CacheError {
        let safe_url = sanitize_url(&self.base);
        let message = match err {
            ureq::Error::Status(code, _response) => {
                format!("server returned status {code} for {safe_url}")
            }
            ureq::Error::Transport(transport) => {
                format!("transport error for {safe_url}: {}", transport.kind())
            }
        };
        CacheError::Http { message }
    }
}

impl RemoteCache for HttpRemoteCache {
    fn load(&self, cache_key: &HashCode) -> Result<Option<Vec<u8>>> {
        let response = match self.agent.get(&self.entry_url(cache_key)).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => return Err(self.http_error(err)),
        };

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(BINCODE_PAYLOAD_LIMIT_BYTES as u64 + 1)
            .read_to_end(&mut bytes)?;
        if bytes.len() > BINCODE_PAYLOAD_LIMIT_BYTES {
            return Err(CacheError::Http {
                message: format!(
                    "entry {cache_key} from {} exceeds {BINCODE_PAYLOAD_LIMIT_BYTES} bytes",
                    sanitize_url(&self.base)
                ),
            });
        }
        Ok(Some(bytes))
    }

    fn store(&self, cache_key: &HashCode, bytes: &[u8]) -> Result<()> {
        self.agent
            .put(&self.entry_url(cache_key))
            .set("Content-Type", "application/octet-stream")
            .send_bytes(bytes)
            .map_err(|err| self.http_error(err))?;
        Ok(())
    }

    fn describe(&self) -> String {
        sanitize_url(&self.base)
    }
}

/// Remote tier backed by a shared directory (network mount, CI volume).
#[derive(Clone, Debug)]
pub struct DirectoryRemoteCache {
    root: PathBuf,
}

impl DirectoryRemoteCache {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, cache_key: &HashCode) -> PathBuf {
        self.root.join(format!("{cache_key}.bin"))
    }
}

impl RemoteCache for DirectoryRemoteCache {
    fn load(&self, cache_key: &HashCode) -> Result<Option<Vec<u8>>> {
        Ok(read_file_limited(&self.entry_path(cache_key)))
    }

    fn store(&self, cache_key: &HashCode, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(cache_key);
        if path.is_file() {
            return Ok(());
        }
        atomic_write(&path, bytes)
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Drops user info and query strings, which may carry credentials.
fn sanitize_url(url: &str) -> String {
    let Some(scheme_idx) = url.find("://") else {
        return url.to_owned();
    };
    let (scheme, rest) = url.split_at(scheme_idx + 3);
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);

    let authority = match authority.rfind('@') {
        Some(at) => format!("{URL_REDACTION}@{}", &authority[at + 1..]),
        None => authority.to_owned(),
    };
    let tail = match tail.find(['?', '#']) {
        Some(pos) => format!("{}?{URL_REDACTION}", &tail[..pos]),
        None => tail.to_owned(),
    };
    format!("{scheme}{authority}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_tier_by_scheme() {
        let http = remote_cache_for_url("https://cache.example.com/keel/").unwrap();
        assert_eq!(http.describe(), "https://cache.example.com/keel");

        let dir = remote_cache_for_url("file:///mnt/shared/keel").unwrap();
        assert_eq!(dir.describe(), "/mnt/shared/keel");

        let plain = remote_cache_for_url("/mnt/shared/keel").unwrap();
        assert_eq!(plain.describe(), "/mnt/shared/keel");

        let err = remote_cache_for_url("s3://user:secret@bucket/keel").unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedRemoteUrl { .. }));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn sanitize_url_redacts_credentials() {
        assert_eq!(
            sanitize_url("https://user:pw@cache.example.com/keel?token=abc"),
            "https://<redacted>@cache.example.com/keel?<redacted>"
        );
        assert_eq!(
            sanitize_url("http://cache.local:8080/keel"),
            "http://cache.local:8080/keel"
        );
    }

    #[test]
    fn directory_remote_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let remote = DirectoryRemoteCache::new(dir.path().join("shared"));
        let key = HashCode::of_bytes(b"entry");

        assert_eq!(remote.load(&key).unwrap(), None);
        remote.store(&key, b"bytes").unwrap();
        assert_eq!(remote.load(&key).unwrap().as_deref(), Some(&b"bytes"[..]));
    }
}
