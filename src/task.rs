use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32, Value, decode, digest, encode};
use crate::engine::ExecContext;
use crate::error::Error;

/// A task definition: a pure function from an input to an output, identified
/// by a globally unique string.
///
/// The body may call other tasks and read or write resources through the
/// [`ExecContext`]; every such interaction is recorded as a dependency of the
/// task instance being executed.
///
/// # Example
///
/// ```rust
/// use kiln::{ExecContext, TaskDef};
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
/// ```
pub trait TaskDef: Send + Sync + 'static {
    /// Stable identifier. Changing it orphans every stored result of the task.
    const ID: &'static str;

    type Input: Serialize + DeserializeOwned + Clone + Debug + Send + Sync;
    type Output: Serialize + DeserializeOwned + Clone + Debug + Send + Sync;

    fn exec(&self, context: &mut ExecContext, input: &Self::Input) -> anyhow::Result<Self::Output>;
}

/// The type-erased foundation that allows the registry to hold task
/// definitions with different input and output types.
pub(crate) trait DynTaskDef: Send + Sync {
    fn exec(&self, context: &mut ExecContext, input: &Value) -> anyhow::Result<Value>;

    fn describe(&self, input: &Value) -> String;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<T> DynTaskDef for T
where
    T: TaskDef,
{
    fn exec(&self, context: &mut ExecContext, input: &Value) -> anyhow::Result<Value> {
        let input: T::Input = decode(input)?;
        let output = TaskDef::exec(self, context, &input)?;
        Ok(encode(&output)?)
    }

    fn describe(&self, input: &Value) -> String {
        match decode::<T::Input>(input) {
            Ok(input) => format!("{}({:?})", T::ID, input),
            Err(_) => format!("{}(<undecodable input>)", T::ID),
        }
    }
}

/// Stable identity of a task instance: the definition id plus a digest of the
/// input. Two invocations with an equal id and an equal input are the same
/// task.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    id: ArcStr,
    digest: Hash32,
}

impl TaskKey {
    pub fn new(id: &str, input: &Value) -> Result<Self, Error> {
        Ok(Self::from_parts(id, digest(input)?))
    }

    pub(crate) fn from_parts(id: &str, digest: Hash32) -> Self {
        Self {
            id: id.into(),
            digest,
        }
    }

    /// Key of the typed task definition `T` applied to `input`.
    pub fn of<T: TaskDef>(input: &T::Input) -> Result<Self, Error> {
        Self::new(T::ID, &encode(input)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn digest(&self) -> Hash32 {
        self.digest
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.id, self.digest.to_short_hex())
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskKey({self})")
    }
}

/// A typed task: a definition bound to a concrete input.
pub struct Task<T: TaskDef> {
    input: T::Input,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: TaskDef> Task<T> {
    pub fn new(input: T::Input) -> Self {
        Self {
            input,
            _phantom: PhantomData,
        }
    }

    pub fn input(&self) -> &T::Input {
        &self.input
    }

    pub fn key(&self) -> Result<TaskKey, Error> {
        TaskKey::of::<T>(&self.input)
    }
}

impl<T: TaskDef> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self::new(self.input.clone())
    }
}

impl<T: TaskDef> Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", T::ID, self.input)
    }
}

/// A task with its definition resolved and its input erased.
#[derive(Clone)]
pub(crate) struct DynTask {
    pub key: TaskKey,
    pub def: Arc<dyn DynTaskDef>,
    pub input: Value,
}

impl DynTask {
    pub(crate) fn exec(&self, context: &mut ExecContext) -> anyhow::Result<Value> {
        self.def.exec(context, &self.input)
    }

    pub(crate) fn describe(&self) -> String {
        self.def.describe(&self.input)
    }
}

impl Debug for DynTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

pub(crate) type Projection = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Maps task definition ids to definitions, and projection ids to output
/// projections.
///
/// This is the only way the engine turns a stored [`TaskKey`] back into
/// something it can execute, so every task that may be required has to be
/// registered here (usually through the [`Blueprint`](crate::Blueprint)).
#[derive(Clone, Default)]
pub struct Registry {
    defs: HashMap<ArcStr, Arc<dyn DynTaskDef>>,
    projections: HashMap<ArcStr, Projection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: TaskDef>(&mut self, def: T) {
        self.defs.insert(T::ID.into(), Arc::new(def));
    }

    pub fn register_projection<F>(&mut self, id: &str, projection: F)
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.projections.insert(id.into(), Arc::new(projection));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.defs.contains_key(id)
    }

    pub(crate) fn def(&self, id: &str) -> Result<Arc<dyn DynTaskDef>, Error> {
        self.defs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskDef(id.into()))
    }

    pub(crate) fn projection(&self, id: &str) -> Result<&Projection, Error> {
        self.projections
            .get(id)
            .ok_or_else(|| Error::UnknownProjection(id.into()))
    }

    /// Erases a typed task.
    pub(crate) fn task<T: TaskDef>(&self, task: &Task<T>) -> Result<DynTask, Error> {
        let input = encode(task.input())?;
        self.dyn_task(T::ID, input)
    }

    /// Rebuilds a task from a definition id and a stored input.
    pub(crate) fn dyn_task(&self, id: &str, input: Value) -> Result<DynTask, Error> {
        let def = self.def(id)?;
        let key = TaskKey::new(id, &input)?;
        Ok(DynTask { key, def, input })
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut defs: Vec<_> = self.defs.keys().collect();
        defs.sort();
        let mut projections: Vec<_> = self.projections.keys().collect();
        projections.sort();

        f.debug_struct("Registry")
            .field("defs", &defs)
            .field("projections", &projections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    impl TaskDef for Double {
        const ID: &'static str = "double";
        type Input = i64;
        type Output = i64;

        fn exec(&self, _: &mut ExecContext, input: &i64) -> anyhow::Result<i64> {
            Ok(input * 2)
        }
    }

    #[test]
    fn test_key_is_structural() {
        let a = Task::<Double>::new(21).key().unwrap();
        let b = Task::<Double>::new(21).key().unwrap();
        let c = Task::<Double>::new(22).key().unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.id(), "double");
    }

    #[test]
    fn test_registry_roundtrip_key() {
        let mut registry = Registry::new();
        registry.register(Double);

        let task = registry.task(&Task::<Double>::new(5)).unwrap();
        let rebuilt = registry.dyn_task("double", task.input.clone()).unwrap();

        assert_eq!(task.key, rebuilt.key);
        assert_eq!(rebuilt.describe(), "double(5)");
    }

    #[test]
    fn test_unknown_definition() {
        let registry = Registry::new();
        let result = registry.task(&Task::<Double>::new(1));
        assert!(matches!(result, Err(Error::UnknownTaskDef(_))));
    }
}
