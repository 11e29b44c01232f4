use crate::config::EngineConfig;
use crate::error::{ExecutionError, Result};
use crate::identity::{derive_cache_key, derive_identity, fingerprint_inputs};
use crate::unit::{ActionContext, UnitOfWork, WorkspaceMode};
use crate::workspace::{find_overlapping_outputs, Workspace, WorkspaceProvider};
use keel_cache::{
    now_millis, remote_cache_for_url, remove_path, BuildCache, CacheEntry, CacheLayout,
    CacheOrigin, ExecutionState, ExecutionStateStore, FileSnapshotter, FileSystemSnapshot,
    HashCode, LocalCacheStore, RecordedOutcome,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionOutcome {
    /// Inputs and outputs matched the last execution; nothing ran.
    UpToDate,
    /// Outputs were restored from the build cache; nothing ran.
    FromCache,
    Executed,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionOutcome::UpToDate => "UP_TO_DATE",
            ExecutionOutcome::FromCache => "FROM_CACHE",
            ExecutionOutcome::Executed => "EXECUTED",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the build cache was neither read nor written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachingDisabled {
    NotCacheable,
    /// Files the unit did not produce were found in its output locations.
    OverlappingOutputs(Vec<PathBuf>),
    /// The unit shares its output locations with other producers.
    SharedOutputLocations,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub identity: String,
    pub cache_key: HashCode,
    pub outcome: ExecutionOutcome,
    /// Final location of every declared output.
    pub outputs: BTreeMap<String, PathBuf>,
    pub output_snapshots: BTreeMap<String, FileSystemSnapshot>,
    pub caching_disabled: Option<CachingDisabled>,
}

/// Input fingerprints and keys computed for one `execute` call.
struct Fingerprinted {
    identity: String,
    cache_key: HashCode,
    identity_fingerprints: BTreeMap<String, HashCode>,
    execution_fingerprints: BTreeMap<String, HashCode>,
}

/// Decides, per unit, whether to skip, restore from cache, or execute.
///
/// Calls for the same identity serialize on the identity's workspace lock
/// (across threads and processes); calls for different identities proceed
/// independently. The engine is `Sync` and meant to be shared.
#[derive(Debug)]
pub struct ExecutionEngine {
    layout: CacheLayout,
    snapshotter: Arc<FileSnapshotter>,
    states: ExecutionStateStore,
    cache: BuildCache,
    workspaces: WorkspaceProvider,
}

impl ExecutionEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_snapshotter(
            config,
            Arc::new(FileSnapshotter::new(config.use_hash_cache)),
        )
    }

    /// Like [`ExecutionEngine::new`], sharing an existing snapshotter (and
    /// its hash cache) with other engines.
    pub fn with_snapshotter(
        config: &EngineConfig,
        snapshotter: Arc<FileSnapshotter>,
    ) -> Result<Self> {
        let layout = CacheLayout::create(&config.cache_root)?;
        let remote = config
            .remote_cache
            .as_deref()
            .map(remote_cache_for_url)
            .transpose()?;
        let cache = BuildCache::new(
            LocalCacheStore::new(layout.cache_dir(), config.local_cache),
            remote,
        );
        Ok(Self {
            states: ExecutionStateStore::new(layout.state_dir()),
            workspaces: WorkspaceProvider::new(layout.clone(), config.lock),
            layout,
            snapshotter,
            cache,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn snapshotter(&self) -> &FileSnapshotter {
        &self.snapshotter
    }

    pub fn state_store(&self) -> &ExecutionStateStore {
        &self.states
    }

    pub fn build_cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Forgets the recorded execution of `identity`, forcing the next
    /// `execute` to restore from cache or run.
    pub fn invalidate(&self, identity: &str) -> bool {
        self.states.remove(identity)
    }

    pub fn execute(&self, unit: &UnitOfWork) -> Result<ExecutionResult> {
        let identity = derive_identity(unit);
        let span = tracing::debug_span!(
            "execute",
            target = "keel.execution",
            identity = %identity,
            unit = %unit.display_name()
        );
        let _entered = span.enter();

        let workspace =
            self.workspaces
                .acquire(&identity)
                .map_err(|source| ExecutionError::Workspace {
                    identity: identity.clone(),
                    source,
                })?;
        tracing::debug!(target = "keel.execution", "locked");

        let identity_fingerprints =
            fingerprint_inputs(unit, unit.identity_inputs(), &self.snapshotter)?;
        let execution_fingerprints =
            fingerprint_inputs(unit, unit.execution_inputs(), &self.snapshotter)?;
        let cache_key = derive_cache_key(&identity_fingerprints, unit.implementation_version());
        let fingerprinted = Fingerprinted {
            identity,
            cache_key,
            identity_fingerprints: identity_fingerprints.into_iter().collect(),
            execution_fingerprints: execution_fingerprints.into_iter().collect(),
        };
        tracing::debug!(target = "keel.execution", cache_key = %cache_key, "fingerprinted");

        let locations: BTreeMap<String, PathBuf> = match unit.workspace_mode() {
            WorkspaceMode::InPlace => unit
                .outputs()
                .iter()
                .map(|(name, path)| (name.clone(), workspace.resolve(path)))
                .collect(),
            WorkspaceMode::Immutable => {
                let dir = self.workspaces.immutable_dir(&cache_key);
                resolve_under(unit, &dir)
            }
        };
        let current = self.snapshot_outputs(unit, &locations)?;
        let previous = self.states.load(&fingerprinted.identity);

        match previous
            .as_ref()
            .map(|previous| out_of_date_reason(previous, &fingerprinted, unit, &current))
        {
            Some(None) => {
                tracing::debug!(target = "keel.execution", outcome = "UP_TO_DATE", "done");
                return Ok(ExecutionResult {
                    identity: fingerprinted.identity,
                    cache_key,
                    outcome: ExecutionOutcome::UpToDate,
                    outputs: locations,
                    output_snapshots: current,
                    caching_disabled: None,
                });
            }
            Some(Some(reason)) => {
                tracing::debug!(target = "keel.execution", reason, "out of date");
            }
            None => {
                tracing::debug!(target = "keel.execution", "no previous execution");
            }
        }

        let result = match unit.workspace_mode() {
            WorkspaceMode::InPlace => self.execute_in_place(
                unit,
                &workspace,
                &fingerprinted,
                locations,
                &current,
                previous.as_ref(),
            ),
            WorkspaceMode::Immutable => self.execute_immutable(unit, &fingerprinted, locations),
        };
        if let Ok(result) = &result {
            tracing::debug!(target = "keel.execution", outcome = %result.outcome, "done");
        }
        result
    }

    fn execute_in_place(
        &self,
        unit: &UnitOfWork,
        workspace: &Workspace,
        fingerprinted: &Fingerprinted,
        locations: BTreeMap<String, PathBuf>,
        current: &BTreeMap<String, FileSystemSnapshot>,
        previous: Option<&ExecutionState>,
    ) -> Result<ExecutionResult> {
        let capabilities = unit.capabilities();
        let overlapping = if capabilities.allows_overlapping_outputs {
            Vec::new()
        } else {
            find_overlapping_outputs(&locations, current, previous)
        };
        let owns_outputs = !capabilities.allows_overlapping_outputs && overlapping.is_empty();

        let caching_disabled = if !overlapping.is_empty() {
            tracing::warn!(
                target = "keel.execution",
                unit = %unit.display_name(),
                count = overlapping.len(),
                first = %overlapping[0].display(),
                "output locations contain files this unit did not produce; caching disabled"
            );
            Some(CachingDisabled::OverlappingOutputs(overlapping))
        } else if !capabilities.cacheable {
            Some(CachingDisabled::NotCacheable)
        } else if capabilities.allows_overlapping_outputs {
            Some(CachingDisabled::SharedOutputLocations)
        } else {
            None
        };

        if caching_disabled.is_none() {
            if let Some(snapshots) = self.restore_from_cache(fingerprinted, &locations) {
                self.record(unit, fingerprinted, &snapshots, RecordedOutcome::FromCache);
                return Ok(ExecutionResult {
                    identity: fingerprinted.identity.clone(),
                    cache_key: fingerprinted.cache_key,
                    outcome: ExecutionOutcome::FromCache,
                    outputs: locations,
                    output_snapshots: snapshots,
                    caching_disabled: None,
                });
            }
        }

        if owns_outputs {
            // Everything present was produced by the previous execution.
            for location in locations.values() {
                remove_path(location).map_err(|source| ExecutionError::Outputs {
                    unit: unit.display_name().to_string(),
                    source,
                })?;
            }
        }

        let started = Instant::now();
        self.run_action(unit, &fingerprinted.identity, workspace.dir(), &locations)?;
        let execution_millis = started.elapsed().as_millis() as u64;

        let snapshots = self.snapshot_outputs(unit, &locations)?;
        self.record(unit, fingerprinted, &snapshots, RecordedOutcome::Executed);
        if caching_disabled.is_none() {
            self.store_in_cache(unit, fingerprinted, &locations, &snapshots, execution_millis);
        }

        Ok(ExecutionResult {
            identity: fingerprinted.identity.clone(),
            cache_key: fingerprinted.cache_key,
            outcome: ExecutionOutcome::Executed,
            outputs: locations,
            output_snapshots: snapshots,
            caching_disabled,
        })
    }

    fn execute_immutable(
        &self,
        unit: &UnitOfWork,
        fingerprinted: &Fingerprinted,
        locations: BTreeMap<String, PathBuf>,
    ) -> Result<ExecutionResult> {
        let workspace_error = |source| ExecutionError::Workspace {
            identity: fingerprinted.identity.clone(),
            source,
        };
        let caching_disabled =
            (!unit.capabilities().cacheable).then_some(CachingDisabled::NotCacheable);

        // Dropping `staging` discards a failed attempt or an unpublished duplicate.
        let staging = self.workspaces.staging_dir().map_err(workspace_error)?;
        let staged = resolve_under(unit, staging.path());

        let restored = if caching_disabled.is_none() {
            self.restore_from_cache(fingerprinted, &staged)
        } else {
            None
        };
        let (outcome, mut snapshots, execution_millis) = match restored {
            Some(snapshots) => (ExecutionOutcome::FromCache, snapshots, 0),
            None => {
                let started = Instant::now();
                self.run_action(unit, &fingerprinted.identity, staging.path(), &staged)?;
                let execution_millis = started.elapsed().as_millis() as u64;
                let snapshots = self.snapshot_outputs(unit, &staged)?;
                (ExecutionOutcome::Executed, snapshots, execution_millis)
            }
        };

        let published = self
            .workspaces
            .publish_immutable(staging.path(), &fingerprinted.cache_key)
            .map_err(workspace_error)?;
        if !published {
            // Another identity with the same key got there first; its tree is
            // what the outputs now point at.
            snapshots = self.snapshot_outputs(unit, &locations)?;
        }

        let recorded = match outcome {
            ExecutionOutcome::FromCache => RecordedOutcome::FromCache,
            _ => RecordedOutcome::Executed,
        };
        self.record(unit, fingerprinted, &snapshots, recorded);
        if outcome == ExecutionOutcome::Executed && caching_disabled.is_none() {
            self.store_in_cache(unit, fingerprinted, &locations, &snapshots, execution_millis);
        }

        Ok(ExecutionResult {
            identity: fingerprinted.identity.clone(),
            cache_key: fingerprinted.cache_key,
            outcome,
            outputs: locations,
            output_snapshots: snapshots,
            caching_disabled,
        })
    }

    fn run_action(
        &self,
        unit: &UnitOfWork,
        identity: &str,
        workspace_dir: &Path,
        locations: &BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        for location in locations.values() {
            if let Some(parent) = location.parent() {
                std::fs::create_dir_all(parent).map_err(|err| ExecutionError::Outputs {
                    unit: unit.display_name().to_string(),
                    source: keel_cache::CacheError::IoAt {
                        path: parent.to_path_buf(),
                        source: err,
                    },
                })?;
            }
        }

        let context = ActionContext {
            identity,
            workspace_dir,
            outputs: locations,
        };
        tracing::debug!(target = "keel.execution", "running action");
        unit.run(&context).map_err(|source| {
            tracing::debug!(target = "keel.execution", error = %source, "action failed");
            ExecutionError::ActionFailed {
                unit: unit.display_name().to_string(),
                source,
            }
        })
    }

    /// Restores a verified cache entry into `locations`. Any failure is a
    /// miss and leaves the locations empty.
    fn restore_from_cache(
        &self,
        fingerprinted: &Fingerprinted,
        locations: &BTreeMap<String, PathBuf>,
    ) -> Option<BTreeMap<String, FileSystemSnapshot>> {
        let cache_key = &fingerprinted.cache_key;
        let entry = self.cache.load(cache_key)?;
        if !entry.outputs.keys().eq(locations.keys()) {
            tracing::debug!(
                target = "keel.execution",
                cache_key = %cache_key,
                "cache entry records different outputs; ignoring it"
            );
            return None;
        }

        match entry.restore(locations, &self.snapshotter) {
            Ok(true) => return Some(entry.outputs),
            Ok(false) => {
                self.cache.local().remove(cache_key);
            }
            Err(err) => {
                tracing::warn!(
                    target = "keel.execution",
                    cache_key = %cache_key,
                    error = %err,
                    "failed to restore outputs from the build cache"
                );
            }
        }
        for location in locations.values() {
            if let Err(err) = remove_path(location) {
                tracing::debug!(
                    target = "keel.execution",
                    path = %location.display(),
                    error = %err,
                    "failed to clear partially restored output"
                );
            }
        }
        None
    }

    fn snapshot_outputs(
        &self,
        unit: &UnitOfWork,
        locations: &BTreeMap<String, PathBuf>,
    ) -> Result<BTreeMap<String, FileSystemSnapshot>> {
        locations
            .iter()
            .map(|(name, location)| {
                let snapshot =
                    self.snapshotter
                        .snapshot(location)
                        .map_err(|source| ExecutionError::Outputs {
                            unit: unit.display_name().to_string(),
                            source,
                        })?;
                Ok((name.clone(), snapshot))
            })
            .collect()
    }

    /// Persists the new state. A failure only costs the next up-to-date check.
    fn record(
        &self,
        unit: &UnitOfWork,
        fingerprinted: &Fingerprinted,
        outputs: &BTreeMap<String, FileSystemSnapshot>,
        outcome: RecordedOutcome,
    ) {
        let state = ExecutionState {
            identity: fingerprinted.identity.clone(),
            cache_key: fingerprinted.cache_key,
            implementation_version: unit.implementation_version().to_string(),
            identity_fingerprints: fingerprinted.identity_fingerprints.clone(),
            execution_fingerprints: fingerprinted.execution_fingerprints.clone(),
            outputs: outputs.clone(),
            outcome,
            saved_at_millis: now_millis(),
        };
        if let Err(err) = self.states.save(&state) {
            tracing::warn!(
                target = "keel.execution",
                identity = %fingerprinted.identity,
                error = %err,
                "failed to record execution state"
            );
        }
    }

    fn store_in_cache(
        &self,
        unit: &UnitOfWork,
        fingerprinted: &Fingerprinted,
        locations: &BTreeMap<String, PathBuf>,
        outputs: &BTreeMap<String, FileSystemSnapshot>,
        execution_millis: u64,
    ) {
        let origin = CacheOrigin {
            identity: fingerprinted.identity.clone(),
            display_name: unit.display_name().to_string(),
            execution_millis,
            created_at_millis: now_millis(),
        };
        match CacheEntry::capture(fingerprinted.cache_key, origin, locations, outputs.clone()) {
            Ok(entry) => self.cache.store(&entry),
            Err(err) => {
                tracing::warn!(
                    target = "keel.execution",
                    cache_key = %fingerprinted.cache_key,
                    error = %err,
                    "failed to pack outputs for the build cache"
                );
            }
        }
    }
}

fn resolve_under(unit: &UnitOfWork, dir: &Path) -> BTreeMap<String, PathBuf> {
    unit.outputs()
        .iter()
        .map(|(name, path)| (name.clone(), dir.join(path)))
        .collect()
}

/// `None` when the previous execution is still valid.
fn out_of_date_reason(
    previous: &ExecutionState,
    fingerprinted: &Fingerprinted,
    unit: &UnitOfWork,
    current_outputs: &BTreeMap<String, FileSystemSnapshot>,
) -> Option<&'static str> {
    if previous.implementation_version != unit.implementation_version() {
        Some("implementation version changed")
    } else if previous.identity_fingerprints != fingerprinted.identity_fingerprints {
        Some("identity inputs changed")
    } else if previous.execution_fingerprints != fingerprinted.execution_fingerprints {
        Some("execution inputs changed")
    } else if previous.cache_key != fingerprinted.cache_key {
        Some("cache key changed")
    } else if previous.outputs != *current_outputs {
        Some("outputs changed")
    } else {
        None
    }
}
