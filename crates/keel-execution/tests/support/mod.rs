#![allow(dead_code)]

use keel_execution::{
    ActionContext, ActionError, EngineConfig, FileInput, LockOptions, NormalizationStrategy,
    UnitOfWork, UnitOfWorkBuilder,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A scratch project directory with its own keel cache root.
pub struct Project {
    tmp: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        init_tracing();
        Self {
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.tmp.path().join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).unwrap()
    }

    /// Engine settings rooted inside the project. Hash caching is off so
    /// same-length rewrites within one mtime tick are still seen.
    pub fn config(&self, cache_dir: &str) -> EngineConfig {
        let mut config = EngineConfig::new(self.path(cache_dir));
        config.use_hash_cache = false;
        config.workers = 4;
        config.lock = LockOptions {
            stale_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        };
        config
    }
}

/// Counts how often an action body ran.
#[derive(Clone, Default)]
pub struct Runs(Arc<AtomicUsize>);

impl Runs {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// `out` := uppercase of `source`.
pub fn uppercase(source: &Path, out: &Path, runs: &Runs) -> UnitOfWorkBuilder {
    let runs = runs.clone();
    let input = source.to_path_buf();
    UnitOfWork::builder("uppercase")
        .identity_input(
            "source",
            FileInput::new([source], NormalizationStrategy::RelativePath),
        )
        .output("out", out)
        .implementation_version("1")
        .action(move |ctx: &ActionContext<'_>| -> Result<(), ActionError> {
            runs.bump();
            let text = std::fs::read_to_string(&input)?;
            let out = ctx.output("out").ok_or("output not declared")?;
            std::fs::write(out, text.to_uppercase())?;
            Ok(())
        })
}
