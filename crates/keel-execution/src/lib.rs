//! Incremental execution of units of work.
//!
//! [`ExecutionEngine::execute`] runs one [`UnitOfWork`] through:
//! identity resolution, workspace locking, input fingerprinting, the
//! up-to-date check against the last recorded execution, build cache lookup,
//! and finally the unit's action. Successful results are recorded (and, for
//! cacheable units, packed into the build cache) before the lock is released.
//!
//! Persistence lives in [`keel_cache`]; this crate decides what to do with it.

mod config;
mod engine;
mod error;
mod identity;
mod pool;
mod unit;
mod workspace;

pub use config::{
    default_workers, EngineConfig, CACHE_DIR_ENV, NO_HASH_CACHE_ENV, REMOTE_CACHE_ENV,
    WORKERS_ENV,
};
pub use engine::{CachingDisabled, ExecutionEngine, ExecutionOutcome, ExecutionResult};
pub use error::{ActionError, ExecutionError, Result};
pub use identity::{derive_cache_key, derive_identity, fingerprint_inputs, InputFingerprints};
pub use pool::WorkerPool;
pub use unit::{
    Action, ActionContext, Capabilities, FileInput, InputValue, UnitOfWork, UnitOfWorkBuilder,
    WorkspaceMode,
};
pub use workspace::{find_overlapping_outputs, Workspace, WorkspaceProvider};

pub use keel_cache::{
    DirectorySensitivity, FileSystemSnapshot, HashCode, LocalCachePolicy, LockOptions,
    NormalizationStrategy, ScalarValue,
};
