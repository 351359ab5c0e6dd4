use std::sync::Arc;

use thiserror::Error;

use crate::resource::ResourceKey;
use crate::task::TaskKey;

pub use anyhow::Error as RuntimeError;

/// Errors surfaced by the engine to the caller of a require.
///
/// The type is cheap to clone so that a single failed execution can be handed
/// to every caller that was waiting on it.
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("Task '{key}' failed:\n{error}")]
    Exec {
        key: TaskKey,
        error: Arc<anyhow::Error>,
    },

    #[error("Build was cancelled")]
    Cancelled,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Couldn't stamp resource '{key}': {source}")]
    Resource {
        key: ResourceKey,
        source: Arc<std::io::Error>,
    },

    #[error("Couldn't convert value: {0}")]
    Codec(String),

    #[error("Task definition '{0}' has not been registered")]
    UnknownTaskDef(Box<str>),

    #[error("Output projection '{0}' has not been registered")]
    UnknownProjection(Box<str>),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn resource(key: &ResourceKey, source: std::io::Error) -> Self {
        Error::Resource {
            key: key.clone(),
            source: Arc::new(source),
        }
    }

    /// Turns the error returned by a task body into an engine error.
    ///
    /// Engine errors raised further down the require chain (a failed callee, a
    /// cancellation, a validation failure) pass through unchanged, even when
    /// the task body added context to them.
    pub(crate) fn from_task(key: &TaskKey, error: anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(inner) => inner.clone(),
            None => Error::Exec {
                key: key.clone(),
                error: Arc::new(error),
            },
        }
    }
}

/// Unsound build specifications detected while building.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Cyclic dependency: requirement of task '{key}' from requirements {}", display_chain(.chain))]
    Cycle { key: TaskKey, chain: Vec<TaskKey> },

    #[error("Overlapping provider tasks for resource '{resource}': provided by '{provider}' and '{other}'")]
    OverlappingProvider {
        resource: ResourceKey,
        provider: TaskKey,
        other: TaskKey,
    },

    #[error(
        "Hidden dependency: task '{requirer}' requires resource '{resource}' provided by task '{provider}' without a (transitive) task dependency from the requirer to the provider"
    )]
    HiddenDependency {
        requirer: TaskKey,
        resource: ResourceKey,
        provider: TaskKey,
    },

    #[error(
        "Hidden dependency: resource '{resource}' was provided by task '{provider}' after being required by task '{requirer}' without a (transitive) task dependency from the requirer to the provider"
    )]
    ProvideAfterRequire {
        requirer: TaskKey,
        resource: ResourceKey,
        provider: TaskKey,
    },

    #[error("Task '{key}' was required with different input in the same session")]
    InconsistentVisit { key: TaskKey },

    #[error("Value of task '{key}' failed a validation check: {reason}")]
    UnstableValue { key: TaskKey, reason: String },
}

fn display_chain(chain: &[TaskKey]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Errors at the persistence boundary.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Couldn't access the store file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode the store.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode the store.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash32;

    fn key(id: &str) -> TaskKey {
        TaskKey::from_parts(id, Hash32::default())
    }

    #[test]
    fn test_callee_error_passes_through() {
        let inner = Error::Exec {
            key: key("callee"),
            error: Arc::new(anyhow::anyhow!("boom")),
        };
        let wrapped = anyhow::Error::new(inner).context("while running caller");

        match Error::from_task(&key("caller"), wrapped) {
            Error::Exec { key: failed, .. } => assert_eq!(failed, key("callee")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancellation_stays_distinct() {
        let wrapped = anyhow::Error::new(Error::Cancelled);
        assert!(Error::from_task(&key("caller"), wrapped).is_cancelled());
    }

    #[test]
    fn test_plain_failure_is_exec() {
        let error = Error::from_task(&key("task"), anyhow::anyhow!("disk full"));
        assert!(matches!(error, Error::Exec { .. }));
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn test_cycle_message() {
        let error = ValidationError::Cycle {
            key: key("a"),
            chain: vec![key("a"), key("b")],
        };
        assert!(error.to_string().contains("->"));
    }
}
