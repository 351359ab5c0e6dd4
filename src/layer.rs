//! Auditing of build specifications.
//!
//! The executors call into a [`Layer`] at fixed points. A layer never changes
//! what gets executed; it either lets the build continue or stops it with a
//! [`ValidationError`].

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::core::{Value, to_bytes};
use crate::error::{Error, ValidationError};
use crate::store::{ResourceProvideDep, ResourceRequireDep, Store, TaskData, TaskRequireDep};
use crate::task::TaskKey;

/// Hook points invoked by both executors.
///
/// Every hook defaults to doing nothing, so an implementation only overrides
/// what it checks.
#[allow(unused_variables)]
pub trait Layer: Send + Sync {
    /// A task key is about to be required.
    fn require_top_down_start(&self, key: &TaskKey, input: &Value) -> Result<(), Error> {
        Ok(())
    }

    /// The require started by `require_top_down_start` has finished, with or
    /// without success.
    fn require_top_down_end(&self, key: &TaskKey) {}

    /// A result produced earlier in the same session is about to be reused.
    fn validate_visited(&self, key: &TaskKey, input: &Value, visited: &TaskData) -> Result<(), Error> {
        Ok(())
    }

    /// `caller` is about to require `callee`.
    fn validate_task_require(&self, caller: &TaskKey, callee: &TaskKey, store: &Store) -> Result<(), Error> {
        Ok(())
    }

    /// `requirer` read a resource. `requires` are the task requires it has
    /// recorded so far in the current execution.
    fn validate_resource_require_dep(
        &self,
        requirer: &TaskKey,
        requires: &[TaskRequireDep],
        dep: &ResourceRequireDep,
        store: &Store,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// `provider` wrote a resource.
    fn validate_resource_provide_dep(
        &self,
        provider: &TaskKey,
        dep: &ResourceProvideDep,
        store: &Store,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// `key` finished executing with `output`, which is about to be committed.
    fn validate_task_output(&self, key: &TaskKey, output: &Value, store: &Store) -> Result<(), Error> {
        Ok(())
    }
}

/// Performs no checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLayer;

impl Layer for NoopLayer {}

/// Which checks a [`ValidationLayer`] runs, and whether they stop the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Reject tasks that (transitively) require themselves.
    pub cycle: bool,
    /// Reject two tasks writing the same resource.
    pub overlapping_provide: bool,
    /// Reject reads of a generated resource without a task dependency on the
    /// task that generates it.
    pub hidden_dependency: bool,
    /// Warn about inputs and outputs that do not survive an encoding round
    /// trip unchanged.
    pub check_serialization: bool,
    /// Fail the require on errors, instead of only logging them.
    pub throw_errors: bool,
    /// Fail the require on warnings, instead of only logging them.
    pub throw_warnings: bool,
}

impl ValidationOptions {
    pub fn normal() -> Self {
        Self {
            cycle: true,
            overlapping_provide: true,
            hidden_dependency: true,
            check_serialization: false,
            throw_errors: true,
            throw_warnings: false,
        }
    }

    pub fn all() -> Self {
        Self {
            cycle: true,
            overlapping_provide: true,
            hidden_dependency: true,
            check_serialization: true,
            throw_errors: true,
            throw_warnings: true,
        }
    }
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self::normal()
    }
}

/// Checks the build specification while it is being built.
///
/// Cycles are detected per thread: each thread keeps the chain of task keys
/// it is currently requiring.
pub struct ValidationLayer {
    options: ValidationOptions,
    executing: Mutex<HashMap<ThreadId, Vec<TaskKey>>>,
}

impl ValidationLayer {
    pub fn new(options: ValidationOptions) -> Self {
        Self {
            options,
            executing: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    fn error(&self, error: ValidationError) -> Result<(), Error> {
        if self.options.throw_errors {
            return Err(error.into());
        }
        tracing::error!("{error}");
        Ok(())
    }

    fn warning(&self, error: ValidationError) -> Result<(), Error> {
        if self.options.throw_warnings {
            return Err(error.into());
        }
        tracing::warn!("{error}");
        Ok(())
    }

    fn check_cycle(&self, key: &TaskKey) -> Result<(), Error> {
        if !self.options.cycle {
            return Ok(());
        }

        let chain = {
            let executing = self.executing.lock();
            match executing.get(&thread::current().id()) {
                Some(stack) if stack.contains(key) => {
                    let start = stack.iter().position(|k| k == key).unwrap_or(0);
                    Some(stack[start..].to_vec())
                }
                _ => None,
            }
        };

        match chain {
            Some(chain) => self.error(ValidationError::Cycle {
                key: key.clone(),
                chain,
            }),
            None => Ok(()),
        }
    }

    fn check_serialization(&self, key: &TaskKey, value: &Value, what: &str) -> Result<(), Error> {
        if !self.options.check_serialization {
            return Ok(());
        }

        if let Some(reason) = unstable(value, what) {
            return self.warning(ValidationError::UnstableValue {
                key: key.clone(),
                reason,
            });
        }
        Ok(())
    }
}

impl Default for ValidationLayer {
    fn default() -> Self {
        Self::new(ValidationOptions::normal())
    }
}

/// Why `value` does not survive an encode and decode unchanged, if it does
/// not.
fn unstable(value: &Value, what: &str) -> Option<String> {
    let bytes = match to_bytes(value) {
        Ok(bytes) => bytes,
        Err(e) => return Some(format!("{what} could not be encoded: {e}")),
    };

    match ciborium::from_reader::<Value, _>(bytes.as_slice()) {
        Ok(decoded) if &decoded == value => None,
        Ok(_) => Some(format!("{what} is not equal to itself after decoding")),
        Err(e) => Some(format!("{what} could not be decoded: {e}")),
    }
}

impl Layer for ValidationLayer {
    fn require_top_down_start(&self, key: &TaskKey, input: &Value) -> Result<(), Error> {
        self.check_cycle(key)?;
        self.executing
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(key.clone());

        if let Err(e) = self.check_serialization(key, input, "input") {
            self.require_top_down_end(key);
            return Err(e);
        }
        Ok(())
    }

    fn require_top_down_end(&self, key: &TaskKey) {
        let mut executing = self.executing.lock();
        let id = thread::current().id();
        if let Some(stack) = executing.get_mut(&id) {
            if let Some(index) = stack.iter().rposition(|k| k == key) {
                stack.remove(index);
            }
            if stack.is_empty() {
                executing.remove(&id);
            }
        }
    }

    fn validate_visited(&self, key: &TaskKey, input: &Value, visited: &TaskData) -> Result<(), Error> {
        if &visited.input != input {
            return self.error(ValidationError::InconsistentVisit { key: key.clone() });
        }
        Ok(())
    }

    fn validate_task_require(&self, _: &TaskKey, callee: &TaskKey, _: &Store) -> Result<(), Error> {
        self.check_cycle(callee)
    }

    fn validate_resource_require_dep(
        &self,
        requirer: &TaskKey,
        requires: &[TaskRequireDep],
        dep: &ResourceRequireDep,
        store: &Store,
    ) -> Result<(), Error> {
        if !self.options.hidden_dependency {
            return Ok(());
        }

        let Some(provider) = store.provider_of(&dep.key) else {
            return Ok(());
        };
        if &provider == requirer {
            return Ok(());
        }

        // The requirer's edges of this execution are not committed yet.
        if !store.reaches(requires.iter().map(|dep| dep.callee.clone()), &provider) {
            return self.error(ValidationError::HiddenDependency {
                requirer: requirer.clone(),
                resource: dep.key.clone(),
                provider,
            });
        }
        Ok(())
    }

    fn validate_resource_provide_dep(
        &self,
        provider: &TaskKey,
        dep: &ResourceProvideDep,
        store: &Store,
    ) -> Result<(), Error> {
        if self.options.overlapping_provide
            && let Some(other) = store.provider_of(&dep.key)
            && &other != provider
        {
            self.error(ValidationError::OverlappingProvider {
                resource: dep.key.clone(),
                provider: provider.clone(),
                other,
            })?;
        }

        if self.options.hidden_dependency {
            for requirer in store.requirees_of(&dep.key) {
                if &requirer != provider && !store.does_require_transitively(&requirer, provider) {
                    self.error(ValidationError::ProvideAfterRequire {
                        requirer,
                        resource: dep.key.clone(),
                        provider: provider.clone(),
                    })?;
                }
            }
        }

        Ok(())
    }

    fn validate_task_output(&self, key: &TaskKey, output: &Value, _: &Store) -> Result<(), Error> {
        self.check_serialization(key, output, "output")
    }
}
