use keel_cache::CacheError;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Error returned by a unit's action. Passed through to the caller untouched.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid unit of work `{unit}`: {reason}")]
    InvalidUnit { unit: String, reason: String },

    #[error("{unit}: input `{property}` does not exist: {}", .path.display())]
    MissingInput {
        unit: String,
        property: String,
        path: PathBuf,
    },

    #[error("{unit}: failed to read input `{property}`: {source}")]
    Input {
        unit: String,
        property: String,
        #[source]
        source: CacheError,
    },

    #[error("failed to acquire workspace for `{identity}`: {source}")]
    Workspace {
        identity: String,
        #[source]
        source: CacheError,
    },

    #[error("{unit}: failed to snapshot outputs: {source}")]
    Outputs {
        unit: String,
        #[source]
        source: CacheError,
    },

    #[error("{unit}: action failed: {source}")]
    ActionFailed {
        unit: String,
        #[source]
        source: ActionError,
    },

    #[error("invalid configuration {key}={value:?}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ExecutionError {
    /// The action's own error, when this is an action failure.
    pub fn action_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ExecutionError::ActionFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("exit code 2")]
    struct ExitCode;

    #[test]
    fn action_failure_keeps_the_action_error() {
        let err = ExecutionError::ActionFailed {
            unit: "compileJava".to_string(),
            source: Box::new(ExitCode),
        };
        assert_eq!(err.to_string(), "compileJava: action failed: exit code 2");
        assert!(err.action_error().is_some_and(|source| source.is::<ExitCode>()));
        assert!(std::error::Error::source(&err).is_some());

        let other = ExecutionError::InvalidUnit {
            unit: "x".to_string(),
            reason: "no action".to_string(),
        };
        assert!(other.action_error().is_none());
    }
}
