use std::sync::Arc;

use crate::core::{Output, Value};
use crate::engine::{CancelToken, Runner};
use crate::error::{Error, ValidationError};
use crate::resource::{ResourceKey, ResourceService};
use crate::stamp::{OutputStamper, ResourceStamp, ResourceStamper};
use crate::store::{ResourceProvideDep, ResourceRequireDep, TaskData, TaskRequireDep};
use crate::task::{DynTask, Task, TaskDef, TaskKey};

/// The capability handed to a task body while it executes.
///
/// Every task, resource read and resource write made through the context is
/// recorded as a dependency of the executing task. The recorded dependencies
/// replace the stored ones only when the body returns successfully.
pub struct ExecContext<'r> {
    runner: &'r Runner<'r>,
    key: TaskKey,
    previous: Option<Arc<TaskData>>,
    task_requires: Vec<TaskRequireDep>,
    resource_requires: Vec<ResourceRequireDep>,
    resource_provides: Vec<ResourceProvideDep>,
}

impl<'r> ExecContext<'r> {
    pub(crate) fn new(runner: &'r Runner<'r>, key: TaskKey, previous: Option<Arc<TaskData>>) -> Self {
        Self {
            runner,
            key,
            previous,
            task_requires: Vec::new(),
            resource_requires: Vec::new(),
            resource_provides: Vec::new(),
        }
    }

    /// Requires `task`, comparing its output by equality.
    pub fn require<T: TaskDef>(&mut self, task: &Task<T>) -> Result<T::Output, Error> {
        self.require_with(task, OutputStamper::Equals)
    }

    /// Requires `task`, comparing its output through `stamper`. Whether the
    /// executing task is affected by a change of the callee is decided by
    /// the stamp, not by the output itself.
    pub fn require_with<T: TaskDef>(&mut self, task: &Task<T>, stamper: OutputStamper) -> Result<T::Output, Error> {
        let task = self.runner.session.registry().task(task)?;
        self.require_task(task, stamper)?.decode()
    }

    /// Requires the task defined by `id` applied to an already encoded
    /// `input`.
    pub fn require_dyn(&mut self, id: &str, input: Value, stamper: OutputStamper) -> Result<Output, Error> {
        let task = self.runner.session.registry().dyn_task(id, input)?;
        self.require_task(task, stamper)
    }

    fn require_task(&mut self, task: DynTask, stamper: OutputStamper) -> Result<Output, Error> {
        self.runner.cancel.check()?;

        let session = self.runner.session;
        session
            .layer()
            .validate_task_require(&self.key, &task.key, session.store())?;

        let data = self.runner.require(&task)?;
        let stamp = stamper.stamp(data.output.value(), session.registry())?;
        let dep = TaskRequireDep {
            callee: task.key,
            stamp,
        };
        if !self.task_requires.contains(&dep) {
            self.task_requires.push(dep);
        }

        Ok(data.output.clone())
    }

    /// Records a read of the resource `key` and returns its current stamp.
    /// Stamp before reading, so the stamp describes what was read.
    pub fn require_resource(&mut self, key: impl Into<ResourceKey>, stamper: ResourceStamper) -> Result<ResourceStamp, Error> {
        let key = key.into();
        let stamp = self.stamp(&key, &stamper)?;
        let dep = ResourceRequireDep {
            key,
            stamp: stamp.clone(),
        };

        let session = self.runner.session;
        session.layer().validate_resource_require_dep(
            &self.key,
            &self.task_requires,
            &dep,
            session.store(),
        )?;

        if !self.resource_requires.contains(&dep) {
            self.resource_requires.push(dep);
        }
        Ok(stamp)
    }

    /// Records a write of the resource `key` and returns its current stamp.
    /// Call it after writing, so the stamp describes what was written.
    ///
    /// Fails when another task is already recorded as the provider of `key`.
    pub fn provide(&mut self, key: impl Into<ResourceKey>, stamper: ResourceStamper) -> Result<ResourceStamp, Error> {
        let key = key.into();
        let stamp = self.stamp(&key, &stamper)?;
        let dep = ResourceProvideDep {
            key,
            stamp: stamp.clone(),
        };

        let session = self.runner.session;
        let store = session.store();
        session
            .layer()
            .validate_resource_provide_dep(&self.key, &dep, store)?;

        if let Some(other) = store.provider_of(&dep.key)
            && other != self.key
        {
            return Err(ValidationError::OverlappingProvider {
                resource: dep.key,
                provider: self.key.clone(),
                other,
            }
            .into());
        }

        // Providing the same resource again replaces the earlier record.
        self.resource_provides.retain(|d| d.key != dep.key);
        self.resource_provides.push(dep);
        Ok(stamp)
    }

    /// Whether the resource `key` differs from what the previous execution of
    /// this task read or wrote. Resources unknown to the previous execution
    /// count as changed.
    pub fn resource_changed(&self, key: impl Into<ResourceKey>) -> Result<bool, Error> {
        let key = key.into();
        let Some(previous) = &self.previous else {
            return Ok(true);
        };

        let resources = self.resources();
        if let Some(dep) = previous.resource_requires.iter().find(|d| d.key == key) {
            return Ok(dep.check(resources)?.is_some());
        }
        if let Some(dep) = previous.resource_provides.iter().find(|d| d.key == key) {
            return Ok(dep.check(resources)?.is_some());
        }

        Ok(true)
    }

    fn stamp(&self, key: &ResourceKey, stamper: &ResourceStamper) -> Result<ResourceStamp, Error> {
        let resource = self
            .resources()
            .resource(key)
            .map_err(|e| Error::resource(key, e))?;
        stamper
            .stamp(resource.as_ref())
            .map_err(|e| Error::resource(key, e))
    }

    /// Input of the previous successful execution of this task.
    pub fn previous_input(&self) -> Option<&Value> {
        self.previous.as_ref().map(|data| &data.input)
    }

    /// Output of the previous successful execution of this task.
    pub fn previous_output(&self) -> Option<&Output> {
        self.previous.as_ref().map(|data| &data.output)
    }

    pub fn resources(&self) -> &dyn ResourceService {
        self.runner.session.resources()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.runner.cancel
    }

    /// Key of the executing task.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub(crate) fn into_data(self, input: Value, output: Output) -> TaskData {
        TaskData {
            input,
            output,
            task_requires: self.task_requires,
            resource_requires: self.resource_requires,
            resource_provides: self.resource_provides,
        }
    }
}

impl std::fmt::Debug for ExecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("key", &self.key)
            .field("task_requires", &self.task_requires.len())
            .field("resource_requires", &self.resource_requires.len())
            .field("resource_provides", &self.resource_provides.len())
            .finish()
    }
}
