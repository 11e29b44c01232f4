use crate::error::Result;
use crate::hash::HashCode;
use crate::record::{self, RecordKind};
use crate::snapshot::FileSystemSnapshot;
use crate::util::{atomic_write, read_file_limited, remove_file_best_effort};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const EXECUTION_STATE_FORMAT_VERSION: u32 = 1;

const STATE_RECORD: RecordKind = RecordKind {
    magic: *b"KEELSTAT",
    format_version: EXECUTION_STATE_FORMAT_VERSION,
    what: "execution state",
};

/// How the recorded outputs came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordedOutcome {
    Executed,
    FromCache,
}

/// Everything remembered about the last successful execution of an identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub identity: String,
    pub cache_key: HashCode,
    pub implementation_version: String,
    pub identity_fingerprints: BTreeMap<String, HashCode>,
    pub execution_fingerprints: BTreeMap<String, HashCode>,
    pub outputs: BTreeMap<String, FileSystemSnapshot>,
    pub outcome: RecordedOutcome,
    pub saved_at_millis: u64,
}

/// Durable per-identity [`ExecutionState`] records.
///
/// Each identity maps to `<root>/<sha256(identity)>.bin`. Records are replaced
/// atomically, and any unreadable, corrupted, or foreign record reads as "no
/// prior state".
#[derive(Clone, Debug)]
pub struct ExecutionStateStore {
    root: PathBuf,
}

impl ExecutionStateStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self, identity: &str) -> Option<ExecutionState> {
        let path = self.record_path(identity);
        let bytes = read_file_limited(&path)?;
        let state: ExecutionState = match record::decode(STATE_RECORD, &bytes) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    target = "keel.cache",
                    identity,
                    path = %path.display(),
                    error = %err,
                    "discarding unreadable execution state"
                );
                remove_file_best_effort(&path, "execution_state.corrupt");
                return None;
            }
        };

        if state.identity != identity {
            // Hash collision on the file name. Leave the other identity's
            // record alone.
            tracing::debug!(
                target = "keel.cache",
                identity,
                stored_identity = %state.identity,
                "execution state belongs to a different identity"
            );
            return None;
        }
        Some(state)
    }

    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        let bytes = record::encode(STATE_RECORD, state)?;
        atomic_write(&self.record_path(&state.identity), &bytes)
    }

    pub fn remove(&self, identity: &str) -> bool {
        remove_file_best_effort(&self.record_path(identity), "execution_state.remove")
    }

    fn record_path(&self, identity: &str) -> PathBuf {
        self.root
            .join(format!("{}.bin", HashCode::of_bytes(identity.as_bytes())))
    }
}
