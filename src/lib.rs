#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod core;
mod engine;
mod error;
mod layer;
#[cfg(feature = "logging")]
pub mod logging;
mod observer;
mod resource;
mod share;
mod stamp;
pub mod store;
mod task;

use std::sync::Arc;

use camino::Utf8Path;

pub use crate::blueprint::Blueprint;
pub use crate::core::{Hash32, Output, Value, decode, encode};
pub use crate::engine::{CancelToken, Diagnostics, ExecContext, Session, TaskExecution};
pub use crate::error::*;
pub use crate::layer::{Layer, NoopLayer, ValidationLayer, ValidationOptions};
pub use crate::observer::Observers;
pub use crate::resource::{FsResource, FsResources, Resource, ResourceKey, ResourceService};
pub use crate::share::SharePolicy;
pub use crate::stamp::{
    MODIFIED_EMPTY, MODIFIED_MISSING, OutputStamp, OutputStamper, ResourceStamp, ResourceStamper,
    StampValue, Walk,
};
pub use crate::store::{Store, TaskData};
pub use crate::task::{Registry, Task, TaskDef, TaskKey};

/// An incremental build engine: the registered task definitions, the
/// persistent dependency store, and the collaborators builds run with.
///
/// The engine itself does not build anything. Builds happen in a [`Session`],
/// which borrows the engine exclusively for as long as it lives:
///
/// ```rust
/// use kiln::{Blueprint, ExecContext, Task, TaskDef};
///
/// struct Greet;
///
/// impl TaskDef for Greet {
///     const ID: &'static str = "greet";
///     type Input = String;
///     type Output = String;
///
///     fn exec(&self, _: &mut ExecContext, name: &String) -> anyhow::Result<String> {
///         Ok(format!("Hello, {name}!"))
///     }
/// }
///
/// let mut engine = Blueprint::new().task(Greet).finish();
///
/// let greeting = engine
///     .session()
///     .require(&Task::<Greet>::new("world".into()))
///     .unwrap();
///
/// assert_eq!(greeting, "Hello, world!");
/// assert_eq!(engine.store().len(), 1);
/// ```
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) store: Store,
    pub(crate) resources: Arc<dyn ResourceService>,
    pub(crate) layer: Arc<dyn Layer>,
    pub(crate) share: SharePolicy,
    pub(crate) observers: Observers,
}

impl Engine {
    /// Starts a new session. Anything visited in a previous session is
    /// forgotten, so a new session must be started after resources were
    /// changed outside of the engine.
    pub fn session(&mut self) -> Session<'_> {
        Session::new(self)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resources(&self) -> &dyn ResourceService {
        self.resources.as_ref()
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Forgets every stored result, so the next build executes from scratch.
    pub fn drop_store(&mut self) {
        tracing::debug!(tasks = self.store.len(), "dropping store");
        self.store.clear();
    }

    /// Replaces the store, e.g. with one restored from disk.
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = store;
        self
    }

    /// Writes the store to `path`.
    pub fn save(&self, path: impl AsRef<Utf8Path>) -> Result<(), PersistError> {
        store::persist::save(&self.store, path)
    }

    /// Replaces the store with the one saved at `path`. A missing file leaves
    /// the engine with an empty store.
    pub fn load(&mut self, path: impl AsRef<Utf8Path>) -> Result<(), PersistError> {
        self.store = store::persist::load(path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("share", &self.share)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}
