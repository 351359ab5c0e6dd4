use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::Level;

use crate::engine::Runner;
use crate::engine::queue::Queue;
use crate::error::{Error, ValidationError};
use crate::resource::ResourceKey;
use crate::store::TaskData;
use crate::task::{DynTask, TaskKey};

/// Tasks a bottom-up build still has to execute, and the ones it is
/// executing right now.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    queue: Mutex<Queue>,
    running: Mutex<Vec<(ThreadId, TaskKey)>>,
}

impl Schedule {
    fn add(&self, key: TaskKey) {
        let mut queue = self.queue.lock();
        if queue.add(key.clone()) {
            tracing::trace!(key = %key, queued = queue.len(), "scheduled");
        }
    }

    /// Whether `key` is being executed by another thread. Fails when this
    /// thread is executing it, since requiring it again can only be a cycle.
    fn running_elsewhere(&self, key: &TaskKey) -> Result<bool, Error> {
        let current = thread::current().id();
        let running = self.running.lock();

        let chain: Vec<&TaskKey> = running
            .iter()
            .filter(|(owner, _)| *owner == current)
            .map(|(_, key)| key)
            .collect();
        if let Some(start) = chain.iter().position(|k| *k == key) {
            return Err(ValidationError::Cycle {
                key: key.clone(),
                chain: chain[start..].iter().map(|&k| k.clone()).collect(),
            }
            .into());
        }

        Ok(running.iter().any(|(_, k)| k == key))
    }
}

/// Marks a task as running on this thread until dropped.
struct Running<'a> {
    schedule: &'a Schedule,
    key: &'a TaskKey,
}

impl<'a> Running<'a> {
    fn start(schedule: &'a Schedule, key: &'a TaskKey) -> Self {
        schedule.running.lock().push((thread::current().id(), key.clone()));
        Self { schedule, key }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let current = thread::current().id();
        let mut running = self.schedule.running.lock();
        if let Some(index) = running
            .iter()
            .rposition(|(owner, key)| *owner == current && key == self.key)
        {
            running.remove(index);
        }
    }
}

impl Runner<'_> {
    /// Re-executes every task affected by the `changed` resources, callees
    /// before callers, and stops propagating wherever a re-executed task's
    /// output no longer differs for its callers.
    pub(crate) fn run(&self, schedule: &Schedule, changed: &[ResourceKey]) -> Result<(), Error> {
        let span = tracing::span!(Level::INFO, "bottom_up", changed = changed.len());
        let _enter = span.enter();

        for resource in changed {
            self.schedule_requirees(resource, None, schedule);
            self.schedule_provider(resource, schedule);
        }

        let store = self.session.store();
        loop {
            let next = schedule.queue.lock().poll(store);
            let Some(key) = next else {
                break;
            };
            self.exec_polled(&key, schedule)?;
        }

        let executed = self.session.diagnostics.lock().executed();
        tracing::info!(executed, "bottom-up build finished");
        Ok(())
    }

    /// Require of `task` while a bottom-up build is running. A task that is
    /// not scheduled, not running, and whose input did not change, is up to
    /// date: every task affected by a change has been scheduled.
    pub(crate) fn require_in_schedule(&self, task: &DynTask, schedule: &Schedule) -> Result<Arc<TaskData>, Error> {
        if let Some(data) = self.reuse_visited(task)? {
            return Ok(data);
        }

        // Its stored data is what is being replaced; wait for the new one.
        if schedule.running_elsewhere(&task.key)? {
            return self.exec_and_schedule(task, schedule);
        }

        let store = self.session.store();
        if !store.contains(&task.key) {
            return self.exec_and_schedule(task, schedule);
        }

        if let Some(data) = self.require_scheduled_now(&task.key, schedule)? {
            return Ok(data);
        }

        match store.data(&task.key) {
            Some(data) if data.input == task.input => {
                let data = Arc::new(data);
                self.session.diagnostics.lock().up_to_date.insert(task.key.clone());
                self.session.mark_visited(&task.key, data.clone());
                Ok(data)
            }
            _ => self.exec_and_schedule(task, schedule),
        }
    }

    /// Executes, in dependency order, the scheduled tasks `key` depends on,
    /// then `key` itself if it is scheduled. Returns the data of `key` if it
    /// was executed.
    fn require_scheduled_now(&self, key: &TaskKey, schedule: &Schedule) -> Result<Option<Arc<TaskData>>, Error> {
        let store = self.session.store();
        loop {
            let next = schedule.queue.lock().poll_least_with_dep_to(key, store);
            let Some(next) = next else {
                return Ok(None);
            };

            let Some(data) = self.exec_polled(&next, schedule)? else {
                continue;
            };
            if &next == key {
                return Ok(Some(data));
            }
        }
    }

    /// Executes a task taken off the queue, unless the tasks executed since
    /// it was scheduled undid whatever made it inconsistent.
    fn exec_polled(&self, key: &TaskKey, schedule: &Schedule) -> Result<Option<Arc<TaskData>>, Error> {
        self.cancel.check()?;

        let Some(task) = self.task_from_store(key)? else {
            return Ok(None);
        };
        if let Some(data) = self.session.visited(key) {
            return Ok(Some(data));
        }

        if let Some(data) = self.session.store().data(key)
            && !self.still_inconsistent(&data)
        {
            tracing::debug!(key = %key, "consistent again, skipped");
            let data = Arc::new(data);
            self.session.diagnostics.lock().up_to_date.insert(key.clone());
            self.session.mark_visited(key, data.clone());
            return Ok(Some(data));
        }

        self.exec_and_schedule(&task, schedule).map(Some)
    }

    /// Whether stored `data` disagrees with its resources or with the callees
    /// visited in this session. Callees not visited did not change.
    fn still_inconsistent(&self, data: &TaskData) -> bool {
        let session = self.session;
        let resources = session.resources();

        data.resource_requires
            .iter()
            .any(|dep| self.is_changed(dep.check(resources)))
            || data
                .resource_provides
                .iter()
                .any(|dep| self.is_changed(dep.check(resources)))
            || data.task_requires.iter().any(|dep| match session.visited(&dep.callee) {
                Some(callee) => self.is_changed(dep.check(callee.output.value(), session.registry())),
                None => false,
            })
    }

    /// Executes `task` unless it was already visited, then schedules whatever
    /// the execution affects.
    fn exec_and_schedule(&self, task: &DynTask, schedule: &Schedule) -> Result<Arc<TaskData>, Error> {
        if let Some(data) = self.session.visited(&task.key) {
            return Ok(data);
        }

        let previous = self.session.store().data(&task.key).map(Arc::new);
        let executed = Cell::new(false);
        let _running = Running::start(schedule, &task.key);
        let data = self.session.share.share(
            &task.key,
            &|| self.session.visited(&task.key),
            &|| {
                executed.set(true);
                self.execute(task, previous.clone())
            },
        )?;

        if executed.get() {
            self.schedule_affected(&task.key, previous.as_deref(), &data, schedule);
        }

        Ok(data)
    }

    /// Notifies the observer of `key` when its output is no longer equal to
    /// the previous one, then schedules the callers and resource readers the
    /// new data makes inconsistent.
    ///
    /// Observers follow output equality, not the stampers of the callers: a
    /// caller reading the output through a projection or `Inconsequential`
    /// may stay up to date while the observer still fires.
    fn schedule_affected(&self, key: &TaskKey, previous: Option<&TaskData>, data: &TaskData, schedule: &Schedule) {
        let session = self.session;
        let store = session.store();

        if previous.is_none_or(|previous| previous.output != data.output) {
            session.engine.observers.notify(key, &data.output);
        }

        for caller in store.callers_of(key) {
            if session.has_been_required(&caller) {
                continue;
            }
            let inconsistent = store
                .task_requires(&caller)
                .iter()
                .filter(|dep| &dep.callee == key)
                .any(|dep| self.is_changed(dep.check(data.output.value(), session.registry())));
            if inconsistent {
                schedule.add(caller);
            }
        }

        for dep in &data.resource_provides {
            self.schedule_requirees(&dep.key, Some(key), schedule);
        }
    }

    /// Schedules the unvisited tasks that read `resource` and no longer see
    /// what they read. `except` is the task that just wrote it.
    fn schedule_requirees(&self, resource: &ResourceKey, except: Option<&TaskKey>, schedule: &Schedule) {
        let session = self.session;
        let store = session.store();

        for requiree in store.requirees_of(resource) {
            if Some(&requiree) == except || session.has_been_required(&requiree) {
                continue;
            }
            let inconsistent = store
                .resource_requires(&requiree)
                .iter()
                .filter(|dep| &dep.key == resource)
                .any(|dep| self.is_changed(dep.check(session.resources())));
            if inconsistent {
                schedule.add(requiree);
            }
        }
    }

    /// Schedules the task that wrote `resource` when the resource no longer
    /// holds what it wrote.
    fn schedule_provider(&self, resource: &ResourceKey, schedule: &Schedule) {
        let session = self.session;
        let store = session.store();

        let Some(provider) = store.provider_of(resource) else {
            return;
        };
        if session.has_been_required(&provider) {
            return;
        }
        let inconsistent = store
            .resource_provides(&provider)
            .iter()
            .filter(|dep| &dep.key == resource)
            .any(|dep| self.is_changed(dep.check(session.resources())));
        if inconsistent {
            schedule.add(provider);
        }
    }
}
