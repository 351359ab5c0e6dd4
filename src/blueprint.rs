use std::sync::Arc;

use crate::Engine;
use crate::core::Value;
use crate::layer::{Layer, NoopLayer, ValidationLayer, ValidationOptions};
use crate::observer::Observers;
use crate::resource::{FsResources, ResourceService};
use crate::share::SharePolicy;
use crate::store::Store;
use crate::task::{Registry, TaskDef};

/// The blueprint for your engine.
///
/// `Blueprint` is used to register every task definition and output
/// projection the engine may encounter, and to pick the collaborators it runs
/// with. Nothing is looked up ambiently: a task whose definition was not
/// registered here can not be required, or revived from a persisted store.
///
/// Once configured, you convert this into an [`Engine`] to run builds.
///
/// # Example
///
/// ```rust
/// use kiln::{Blueprint, ValidationOptions};
///
/// let engine = Blueprint::new()
///     .projection("len", |value| match value {
///         kiln::Value::Text(text) => kiln::Value::from(text.len() as u64),
///         other => other.clone(),
///     })
///     .validate(ValidationOptions::all())
///     .finish();
/// ```
pub struct Blueprint {
    registry: Registry,
    resources: Arc<dyn ResourceService>,
    layer: Arc<dyn Layer>,
    share: SharePolicy,
}

impl Blueprint {
    /// Creates a new, empty configuration: filesystem resources relative to
    /// the working directory, no validation, blocking share.
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            resources: Arc::new(FsResources::new()),
            layer: Arc::new(NoopLayer),
            share: SharePolicy::default(),
        }
    }

    /// Registers a task definition under its [`TaskDef::ID`]. Registering a
    /// second definition with the same id replaces the first.
    pub fn task<T: TaskDef>(mut self, def: T) -> Self {
        self.registry.register(def);
        self
    }

    /// Registers an output projection usable through
    /// [`OutputStamper::Projection`](crate::OutputStamper::Projection).
    pub fn projection<F>(mut self, id: &str, projection: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.registry.register_projection(id, projection);
        self
    }

    pub fn resources(mut self, resources: impl ResourceService + 'static) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    /// Checks builds with a [`ValidationLayer`] configured by `options`.
    pub fn validate(self, options: ValidationOptions) -> Self {
        self.layer(ValidationLayer::new(options))
    }

    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layer = Arc::new(layer);
        self
    }

    pub fn share(mut self, share: SharePolicy) -> Self {
        self.share = share;
        self
    }

    pub fn finish(self) -> Engine {
        tracing::debug!(registry = ?self.registry, share = ?self.share, "engine assembled");

        Engine {
            registry: self.registry,
            store: Store::new(),
            resources: self.resources,
            layer: self.layer,
            share: self.share,
            observers: Observers::new(),
        }
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("registry", &self.registry)
            .field("share", &self.share)
            .finish_non_exhaustive()
    }
}
