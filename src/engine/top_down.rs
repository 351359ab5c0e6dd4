use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::Level;

use crate::core::Output;
use crate::engine::{ExecContext, Runner};
use crate::error::Error;
use crate::layer::Layer;
use crate::resource::ResourceKey;
use crate::store::TaskData;
use crate::task::{DynTask, TaskKey};

/// Why stored data can not be reused.
#[derive(Debug)]
pub(crate) enum Inconsistency {
    Input,
    ResourceRequire(ResourceKey),
    ResourceProvide(ResourceKey),
    TaskRequire(TaskKey),
    MissingCallee(TaskKey),
}

impl Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inconsistency::Input => write!(f, "input differs from the stored input"),
            Inconsistency::ResourceRequire(key) => write!(f, "required resource '{key}' changed"),
            Inconsistency::ResourceProvide(key) => write!(f, "provided resource '{key}' changed"),
            Inconsistency::TaskRequire(key) => write!(f, "output of required task '{key}' changed"),
            Inconsistency::MissingCallee(key) => write!(f, "required task '{key}' has no stored data"),
        }
    }
}

/// Ends a require on the layer when dropped, including while unwinding.
struct Requiring<'a> {
    layer: &'a dyn Layer,
    key: &'a TaskKey,
}

impl Drop for Requiring<'_> {
    fn drop(&mut self) {
        self.layer.require_top_down_end(self.key);
    }
}

impl Runner<'_> {
    /// Resolves `task` to up-to-date data. Every require, from the session or
    /// from a task body, passes through here.
    pub(crate) fn require(&self, task: &DynTask) -> Result<Arc<TaskData>, Error> {
        self.cancel.check()?;

        let layer = self.session.layer();
        layer.require_top_down_start(&task.key, &task.input)?;
        let _requiring = Requiring { layer, key: &task.key };

        match self.schedule {
            None => self.require_top_down(task),
            Some(schedule) => self.require_in_schedule(task, schedule),
        }
    }

    fn require_top_down(&self, task: &DynTask) -> Result<Arc<TaskData>, Error> {
        if let Some(data) = self.reuse_visited(task)? {
            return Ok(data);
        }

        self.session.share.share(
            &task.key,
            &|| self.session.visited(&task.key),
            &|| self.resolve(task),
        )
    }

    /// The result of `task` from earlier in this session, if there is one.
    pub(crate) fn reuse_visited(&self, task: &DynTask) -> Result<Option<Arc<TaskData>>, Error> {
        let Some(data) = self.session.visited(&task.key) else {
            return Ok(None);
        };

        self.session
            .layer()
            .validate_visited(&task.key, &task.input, &data)?;
        self.session.diagnostics.lock().reused += 1;

        Ok(Some(data))
    }

    /// Reuses stored data when all of its dependencies are consistent,
    /// executes the task otherwise.
    fn resolve(&self, task: &DynTask) -> Result<Arc<TaskData>, Error> {
        let Some(data) = self.session.store().data(&task.key) else {
            tracing::debug!(key = %task.key, "no stored data");
            return self.execute(task, None);
        };

        let data = Arc::new(data);
        if let Some(reason) = self.check(task, &data)? {
            tracing::debug!(key = %task.key, "{reason}");
            return self.execute(task, Some(data));
        }

        tracing::trace!(key = %task.key, "up to date");
        self.session.diagnostics.lock().up_to_date.insert(task.key.clone());
        self.session.mark_visited(&task.key, data.clone());

        Ok(data)
    }

    /// The first reason why `data` is no longer consistent, in order: input,
    /// required resources, provided resources, required tasks. Required tasks
    /// are brought up to date themselves in the process.
    fn check(&self, task: &DynTask, data: &TaskData) -> Result<Option<Inconsistency>, Error> {
        if data.input != task.input {
            return Ok(Some(Inconsistency::Input));
        }

        let resources = self.session.resources();
        for dep in &data.resource_requires {
            if self.is_changed(dep.check(resources)) {
                return Ok(Some(Inconsistency::ResourceRequire(dep.key.clone())));
            }
        }
        for dep in &data.resource_provides {
            if self.is_changed(dep.check(resources)) {
                return Ok(Some(Inconsistency::ResourceProvide(dep.key.clone())));
            }
        }

        for dep in &data.task_requires {
            let Some(callee) = self.task_from_store(&dep.callee)? else {
                return Ok(Some(Inconsistency::MissingCallee(dep.callee.clone())));
            };

            let callee = self.require(&callee)?;
            if dep.check(callee.output.value(), self.session.registry())?.is_some() {
                return Ok(Some(Inconsistency::TaskRequire(dep.callee.clone())));
            }
        }

        Ok(None)
    }

    /// A failed stamp counts as a change, and is recorded.
    pub(crate) fn is_changed<T>(&self, check: Result<Option<T>, Error>) -> bool {
        match check {
            Ok(stamp) => stamp.is_some(),
            Err(error) => {
                self.session.record_check_error(error);
                true
            }
        }
    }

    /// Rebuilds the task stored under `key`, if it has stored data.
    pub(crate) fn task_from_store(&self, key: &TaskKey) -> Result<Option<DynTask>, Error> {
        match self.session.store().input(key) {
            Some(input) => Ok(Some(self.session.registry().dyn_task(key.id(), input)?)),
            None => Ok(None),
        }
    }

    /// Runs the body of `task` and commits what it recorded.
    ///
    /// Nothing is committed when the body fails: the store keeps the data of
    /// the previous successful execution.
    pub(crate) fn execute(&self, task: &DynTask, previous: Option<Arc<TaskData>>) -> Result<Arc<TaskData>, Error> {
        self.cancel.check()?;

        let span = tracing::span!(Level::DEBUG, "task", key = %task.key);
        let _enter = span.enter();
        tracing::debug!("executing {}", task.describe());

        let start = Instant::now();
        let mut context = ExecContext::new(self, task.key.clone(), previous);

        // A panicking task body must not take the session down with it, or
        // leave other threads waiting on its result forever.
        let output = match catch_unwind(AssertUnwindSafe(|| task.exec(&mut context))) {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                let error = Error::from_task(&task.key, error);
                tracing::debug!("failed: {error}");
                return Err(error);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Task panicked: {s}")
                } else {
                    String::from("Task panicked with unknown payload")
                };

                return Err(Error::from_task(&task.key, anyhow::anyhow!(msg)));
            }
        };

        let duration = start.elapsed();
        self.session
            .diagnostics
            .lock()
            .record_execution(&task.key, start, duration);

        let store = self.session.store();
        self.session
            .layer()
            .validate_task_output(&task.key, &output, store)?;

        let data = context.into_data(task.input.clone(), Output::new(output));
        store.set_data(&task.key, data.clone());

        let data = Arc::new(data);
        self.session.mark_visited(&task.key, data.clone());

        tracing::debug!(?duration, "committed");
        Ok(data)
    }
}
