//! Sessions and the two build algorithms.
//!
//! A [`Session`] is the unit of "each task is resolved at most once". It is
//! obtained from an [`Engine`](crate::Engine), used for one logical build, and
//! dropped; anything visited in it is forgotten with it.
//!
//! * [`Session::require`] is a top-down build: demand driven, it resolves one
//!   task by checking stored dependencies and executing only what is
//!   inconsistent.
//! * [`Session::require_bottom_up`] is a bottom-up build: change driven, it
//!   starts from changed resources and re-executes affected tasks in
//!   dependency order, stopping wherever an output did not change.

mod bottom_up;
mod context;
mod diagnostics;
mod queue;
mod top_down;


use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::Engine;
use crate::core::Output;
use crate::error::Error;
use crate::layer::Layer;
use crate::resource::{ResourceKey, ResourceService};
use crate::share::Share;
use crate::store::{Store, TaskData};
use crate::task::{Registry, Task, TaskDef, TaskKey};

pub use crate::engine::context::ExecContext;
pub use crate::engine::diagnostics::{Diagnostics, TaskExecution};
use crate::engine::bottom_up::Schedule;

/// Cooperative cancellation flag shared between a build and whoever may want
/// to stop it.
///
/// Cancellation is observed before a task is required, before a task body
/// runs, and between bottom-up work items. A cancelled build stops with
/// [`Error::Cancelled`]; whatever was committed before that stays committed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// A single build over an [`Engine`].
///
/// The session borrows the engine exclusively, so the store cannot be swapped
/// or dropped while a build is running. Its methods take `&self`, so one
/// session may be shared between threads; the configured share policy decides
/// how concurrent requires of the same task are reconciled.
pub struct Session<'p> {
    engine: &'p Engine,
    share: Box<dyn Share>,
    visited: RwLock<HashMap<TaskKey, Arc<TaskData>>>,
    diagnostics: Mutex<Diagnostics>,
    check_errors: Mutex<Vec<Error>>,
}

impl<'p> Session<'p> {
    pub(crate) fn new(engine: &'p Engine) -> Self {
        Self {
            engine,
            share: engine.share.build(),
            visited: RwLock::new(HashMap::new()),
            diagnostics: Mutex::new(Diagnostics::default()),
            check_errors: Mutex::new(Vec::new()),
        }
    }

    /// Top-down build of `task`, returning its up-to-date output.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kiln::{Blueprint, ExecContext, Task, TaskDef};
    ///
    /// struct Double;
    ///
    /// impl TaskDef for Double {
    ///     const ID: &'static str = "double";
    ///     type Input = i64;
    ///     type Output = i64;
    ///
    ///     fn exec(&self, _: &mut ExecContext, input: &i64) -> anyhow::Result<i64> {
    ///         Ok(input * 2)
    ///     }
    /// }
    ///
    /// let mut engine = Blueprint::new().task(Double).finish();
    /// let session = engine.session();
    /// assert_eq!(session.require(&Task::<Double>::new(21)).unwrap(), 42);
    /// ```
    pub fn require<T: TaskDef>(&self, task: &Task<T>) -> Result<T::Output, Error> {
        self.require_with_cancel(task, &CancelToken::new())
    }

    pub fn require_with_cancel<T: TaskDef>(
        &self,
        task: &Task<T>,
        cancel: &CancelToken,
    ) -> Result<T::Output, Error> {
        let task = self.engine.registry.task(task)?;
        let data = Runner::top_down(self, cancel).require(&task)?;
        data.output.decode()
    }

    /// Top-down build of every task in `tasks` on the rayon thread pool.
    /// Outputs are returned in the order of `tasks`; the first failure is
    /// returned instead if there is one.
    pub fn require_many<T: TaskDef>(&self, tasks: &[Task<T>]) -> Result<Vec<T::Output>, Error> {
        tasks.par_iter().map(|task| self.require(task)).collect()
    }

    /// Bottom-up build after `changed` resources were modified.
    pub fn require_bottom_up<I>(&self, changed: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = ResourceKey>,
    {
        self.require_bottom_up_with_cancel(changed, &CancelToken::new())
    }

    pub fn require_bottom_up_with_cancel<I>(&self, changed: I, cancel: &CancelToken) -> Result<(), Error>
    where
        I: IntoIterator<Item = ResourceKey>,
    {
        let changed: Vec<_> = changed.into_iter().collect();
        let schedule = Schedule::default();
        Runner::bottom_up(self, cancel, &schedule).run(&schedule, &changed)
    }

    /// Whether `key` was resolved in this session, by any build.
    pub fn has_been_required(&self, key: &TaskKey) -> bool {
        self.visited.read().contains_key(key)
    }

    /// Output `key` was resolved to in this session, if it was.
    pub fn visited_output(&self, key: &TaskKey) -> Option<Output> {
        self.visited.read().get(key).map(|data| data.output.clone())
    }

    pub fn set_observer<F>(&self, key: TaskKey, observer: F)
    where
        F: Fn(&Output) + Send + Sync + 'static,
    {
        self.engine.observers.set(key, observer);
    }

    pub fn remove_observer(&self, key: &TaskKey) -> bool {
        self.engine.observers.remove(key)
    }

    pub fn drop_observers(&self) {
        self.engine.observers.clear();
    }

    /// Errors hit while stamping resources during consistency checks. Each one
    /// made the affected task count as inconsistent rather than failing the
    /// build.
    pub fn dependency_check_errors(&self) -> Vec<Error> {
        self.check_errors.lock().clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.lock().clone()
    }

    pub fn store(&self) -> &Store {
        &self.engine.store
    }

    fn registry(&self) -> &Registry {
        &self.engine.registry
    }

    fn resources(&self) -> &dyn ResourceService {
        self.engine.resources.as_ref()
    }

    fn layer(&self) -> &dyn Layer {
        self.engine.layer.as_ref()
    }

    fn visited(&self, key: &TaskKey) -> Option<Arc<TaskData>> {
        self.visited.read().get(key).cloned()
    }

    fn mark_visited(&self, key: &TaskKey, data: Arc<TaskData>) {
        self.visited.write().insert(key.clone(), data);
    }

    fn record_check_error(&self, error: Error) {
        tracing::warn!("{error}; treating the dependency as changed");
        self.check_errors.lock().push(error);
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("visited", &self.visited.read().len())
            .finish()
    }
}

/// One build running inside a session: the session state plus the
/// cancellation token, and the bottom-up schedule when there is one.
pub(crate) struct Runner<'s> {
    session: &'s Session<'s>,
    cancel: &'s CancelToken,
    schedule: Option<&'s Schedule>,
}

impl<'s> Runner<'s> {
    fn top_down(session: &'s Session<'s>, cancel: &'s CancelToken) -> Self {
        Self {
            session,
            cancel,
            schedule: None,
        }
    }

    fn bottom_up(session: &'s Session<'s>, cancel: &'s CancelToken, schedule: &'s Schedule) -> Self {
        Self {
            session,
            cancel,
            schedule: Some(schedule),
        }
    }
}
