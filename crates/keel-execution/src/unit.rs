use crate::error::{ActionError, ExecutionError, Result};
use keel_cache::{DirectorySensitivity, NormalizationStrategy, ScalarValue};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// The work performed on a miss. Runs with the workspace lock held.
pub type Action = Arc<dyn Fn(&ActionContext<'_>) -> std::result::Result<(), ActionError> + Send + Sync>;

/// A set of file-system roots consumed as one input property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInput {
    pub paths: Vec<PathBuf>,
    pub normalization: NormalizationStrategy,
    pub directories: DirectorySensitivity,
    /// A missing root is fingerprinted instead of failing the unit.
    pub optional: bool,
}

impl FileInput {
    pub fn new(
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
        normalization: NormalizationStrategy,
    ) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            normalization,
            directories: DirectorySensitivity::Default,
            optional: false,
        }
    }

    pub fn ignore_directories(mut self) -> Self {
        self.directories = DirectorySensitivity::IgnoreDirectories;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputValue {
    Scalar(ScalarValue),
    Files(FileInput),
}

impl From<ScalarValue> for InputValue {
    fn from(value: ScalarValue) -> Self {
        InputValue::Scalar(value)
    }
}

impl From<FileInput> for InputValue {
    fn from(value: FileInput) -> Self {
        InputValue::Files(value)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        InputValue::Scalar(value.into())
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        InputValue::Scalar(value.into())
    }
}

impl From<i64> for InputValue {
    fn from(value: i64) -> Self {
        InputValue::Scalar(value.into())
    }
}

impl From<bool> for InputValue {
    fn from(value: bool) -> Self {
        InputValue::Scalar(value.into())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Results may be read from and written to the build cache.
    pub cacheable: bool,
    /// Output locations may be shared with files this unit did not produce.
    /// Foreign files are then neither reported nor cleaned up before the
    /// action runs. In-place units with shared locations are never cached,
    /// since an entry could not tell their files from anyone else's.
    pub allows_overlapping_outputs: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// Outputs live at their declared locations and are reused across runs.
    #[default]
    InPlace,
    /// Outputs are produced in a staging directory and published, read-only
    /// by convention, under `immutable/<cache-key>/`. Output paths must be
    /// relative.
    Immutable,
}

/// One schedulable computation with declared inputs and outputs.
///
/// Built with [`UnitOfWork::builder`]. Input properties keep their
/// declaration order, which feeds the cache key.
#[derive(Clone)]
pub struct UnitOfWork {
    name: String,
    display_name: String,
    identity: Option<String>,
    identity_inputs: Vec<(String, InputValue)>,
    execution_inputs: Vec<(String, InputValue)>,
    outputs: BTreeMap<String, PathBuf>,
    implementation_version: String,
    capabilities: Capabilities,
    workspace_mode: WorkspaceMode,
    action: Action,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("identity_inputs", &self.identity_inputs)
            .field("execution_inputs", &self.execution_inputs)
            .field("outputs", &self.outputs)
            .field("implementation_version", &self.implementation_version)
            .field("capabilities", &self.capabilities)
            .field("workspace_mode", &self.workspace_mode)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    pub fn builder(name: impl Into<String>) -> UnitOfWorkBuilder {
        UnitOfWorkBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// The caller-declared identity, if any.
    pub fn declared_identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn identity_inputs(&self) -> &[(String, InputValue)] {
        &self.identity_inputs
    }

    pub fn execution_inputs(&self) -> &[(String, InputValue)] {
        &self.execution_inputs
    }

    pub fn outputs(&self) -> &BTreeMap<String, PathBuf> {
        &self.outputs
    }

    pub fn implementation_version(&self) -> &str {
        &self.implementation_version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn workspace_mode(&self) -> WorkspaceMode {
        self.workspace_mode
    }

    pub(crate) fn run(&self, context: &ActionContext<'_>) -> std::result::Result<(), ActionError> {
        (self.action)(context)
    }
}

pub struct UnitOfWorkBuilder {
    name: String,
    display_name: Option<String>,
    identity: Option<String>,
    identity_inputs: Vec<(String, InputValue)>,
    execution_inputs: Vec<(String, InputValue)>,
    outputs: Vec<(String, PathBuf)>,
    implementation_version: String,
    capabilities: Capabilities,
    workspace_mode: WorkspaceMode,
    action: Option<Action>,
}

impl UnitOfWorkBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            display_name: None,
            identity: None,
            identity_inputs: Vec::new(),
            execution_inputs: Vec::new(),
            outputs: Vec::new(),
            implementation_version: String::new(),
            capabilities: Capabilities::default(),
            workspace_mode: WorkspaceMode::default(),
            action: None,
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// An input that selects both the identity and the cache key.
    pub fn identity_input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.identity_inputs.push((name.into(), value.into()));
        self
    }

    /// An input that only affects whether previous outputs are up to date.
    pub fn execution_input(
        mut self,
        name: impl Into<String>,
        value: impl Into<InputValue>,
    ) -> Self {
        self.execution_inputs.push((name.into(), value.into()));
        self
    }

    pub fn output(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.outputs.push((name.into(), path.into()));
        self
    }

    pub fn implementation_version(mut self, version: impl Into<String>) -> Self {
        self.implementation_version = version.into();
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.capabilities.cacheable = cacheable;
        self
    }

    pub fn allows_overlapping_outputs(mut self, allows: bool) -> Self {
        self.capabilities.allows_overlapping_outputs = allows;
        self
    }

    pub fn workspace_mode(mut self, mode: WorkspaceMode) -> Self {
        self.workspace_mode = mode;
        self
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&ActionContext<'_>) -> std::result::Result<(), ActionError> + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn build(self) -> Result<UnitOfWork> {
        let invalid = |reason: String| ExecutionError::InvalidUnit {
            unit: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.identity.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(invalid("declared identity must not be empty".to_string()));
        }

        let mut properties = HashSet::new();
        for (property, _) in self.identity_inputs.iter().chain(&self.execution_inputs) {
            if !properties.insert(property.as_str()) {
                return Err(invalid(format!("input `{property}` is declared twice")));
            }
        }

        let mut outputs = BTreeMap::new();
        for (name, path) in &self.outputs {
            if self.workspace_mode == WorkspaceMode::Immutable && !is_plain_relative(path) {
                return Err(invalid(format!(
                    "output `{name}` must be a relative path without `..` in an immutable workspace"
                )));
            }
            if outputs.insert(name.clone(), path.clone()).is_some() {
                return Err(invalid(format!("output `{name}` is declared twice")));
            }
        }

        let Some(action) = self.action.clone() else {
            return Err(invalid("no action".to_string()));
        };

        Ok(UnitOfWork {
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            identity: self.identity,
            identity_inputs: self.identity_inputs,
            execution_inputs: self.execution_inputs,
            outputs,
            implementation_version: self.implementation_version,
            capabilities: self.capabilities,
            workspace_mode: self.workspace_mode,
            action,
        })
    }
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// What an action sees while it runs.
#[derive(Debug)]
pub struct ActionContext<'a> {
    pub(crate) identity: &'a str,
    pub(crate) workspace_dir: &'a Path,
    pub(crate) outputs: &'a BTreeMap<String, PathBuf>,
}

impl ActionContext<'_> {
    pub fn identity(&self) -> &str {
        self.identity
    }

    /// Directory owned by this identity for the duration of the action.
    pub fn workspace_dir(&self) -> &Path {
        self.workspace_dir
    }

    /// Where the action must write the named output.
    pub fn output(&self, name: &str) -> Option<&Path> {
        self.outputs.get(name).map(PathBuf::as_path)
    }

    pub fn outputs(&self) -> &BTreeMap<String, PathBuf> {
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &ActionContext<'_>) -> std::result::Result<(), ActionError> {
        Ok(())
    }

    #[test]
    fn builder_keeps_declaration_order() {
        let unit = UnitOfWork::builder("compile")
            .identity_input("source", "b")
            .identity_input("target", "a")
            .execution_input("debug", true)
            .output("classes", "/tmp/out")
            .action(noop)
            .build()
            .unwrap();

        let names: Vec<_> = unit.identity_inputs().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["source", "target"]);
        assert_eq!(unit.display_name(), "compile");
        assert_eq!(unit.capabilities(), Capabilities::default());
        assert_eq!(unit.workspace_mode(), WorkspaceMode::InPlace);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let err = UnitOfWork::builder("compile")
            .identity_input("source", "a")
            .execution_input("source", "b")
            .action(noop)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{err}");

        let err = UnitOfWork::builder("compile")
            .output("classes", "a")
            .output("classes", "b")
            .action(noop)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{err}");
    }

    #[test]
    fn immutable_outputs_must_stay_inside_the_workspace() {
        for bad in ["/abs/out", "../escape", ""] {
            let result = UnitOfWork::builder("transform")
                .workspace_mode(WorkspaceMode::Immutable)
                .output("out", bad)
                .action(noop)
                .build();
            assert!(result.is_err(), "{bad:?} accepted");
        }

        UnitOfWork::builder("transform")
            .workspace_mode(WorkspaceMode::Immutable)
            .output("out", "lib/out.jar")
            .action(noop)
            .build()
            .unwrap();
    }

    #[test]
    fn action_and_name_are_required() {
        assert!(UnitOfWork::builder("compile").build().is_err());
        assert!(UnitOfWork::builder(" ").action(noop).build().is_err());
    }

    #[test]
    fn file_input_modifiers() {
        let input = FileInput::new(["src"], NormalizationStrategy::RelativePath)
            .ignore_directories()
            .optional();
        assert_eq!(input.directories, DirectorySensitivity::IgnoreDirectories);
        assert!(input.optional);
        assert_eq!(input.paths, [PathBuf::from("src")]);
    }
}
