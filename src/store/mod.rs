//! The dependency store.
//!
//! Forward data ([`TaskData`] per [`TaskKey`]) is the source of truth. Three
//! reverse indexes are derived from it and kept in lock-step by
//! [`Store::set_data`] and [`Store::delete_data`]:
//!
//! * callers of a task,
//! * tasks that read a resource,
//! * the task that wrote a resource.
//!
//! All maps are sharded, so concurrent commits for different keys only contend
//! when they touch the same shard of a reverse index, and only briefly.

mod data;
pub mod persist;
mod shard;

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::{Output, Value};
use crate::resource::ResourceKey;
use crate::task::TaskKey;

pub use crate::store::data::{ResourceProvideDep, ResourceRequireDep, TaskData, TaskRequireDep};
use crate::store::shard::Sharded;

#[derive(Default)]
pub struct Store {
    tasks: Sharded<TaskKey, TaskData>,
    callers: Sharded<TaskKey, HashSet<TaskKey>>,
    requirees: Sharded<ResourceKey, HashSet<TaskKey>>,
    providers: Sharded<ResourceKey, TaskKey>,
}

/// Plain, serializable copy of the forward data in a [`Store`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: Vec<(TaskKey, TaskData)>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self, key: &TaskKey) -> Option<TaskData> {
        self.tasks.get_with(key, TaskData::clone)
    }

    pub fn input(&self, key: &TaskKey) -> Option<Value> {
        self.tasks.get_with(key, |data| data.input.clone())
    }

    pub fn output(&self, key: &TaskKey) -> Option<Output> {
        self.tasks.get_with(key, |data| data.output.clone())
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains(key)
    }

    pub fn task_requires(&self, key: &TaskKey) -> Vec<TaskRequireDep> {
        self.tasks
            .get_with(key, |data| data.task_requires.clone())
            .unwrap_or_default()
    }

    pub fn resource_requires(&self, key: &TaskKey) -> Vec<ResourceRequireDep> {
        self.tasks
            .get_with(key, |data| data.resource_requires.clone())
            .unwrap_or_default()
    }

    pub fn resource_provides(&self, key: &TaskKey) -> Vec<ResourceProvideDep> {
        self.tasks
            .get_with(key, |data| data.resource_provides.clone())
            .unwrap_or_default()
    }

    /// Tasks whose last execution required `callee`, in key order.
    pub fn callers_of(&self, callee: &TaskKey) -> Vec<TaskKey> {
        sorted(self.callers.get_with(callee, HashSet::clone))
    }

    /// Tasks whose last execution read `resource`, in key order.
    pub fn requirees_of(&self, resource: &ResourceKey) -> Vec<TaskKey> {
        sorted(self.requirees.get_with(resource, HashSet::clone))
    }

    pub fn provider_of(&self, resource: &ResourceKey) -> Option<TaskKey> {
        self.providers.get_with(resource, TaskKey::clone)
    }

    /// Replaces everything recorded for `key` with `data`.
    ///
    /// Reverse index entries for edges that only the old data had are removed,
    /// entries for new edges are added. The shard owning `key` stays locked for
    /// the whole update, so two commits for the same key cannot interleave.
    pub fn set_data(&self, key: &TaskKey, data: TaskData) {
        let mut shard = self.tasks.write(key);
        let old = shard.remove(key);
        self.unlink(key, old.as_ref(), Some(&data));
        self.link(key, &data);
        shard.insert(key.clone(), data);
    }

    /// Removes everything recorded for `key`. Edges other tasks hold towards
    /// `key` stay intact.
    pub fn delete_data(&self, key: &TaskKey) -> Option<TaskData> {
        let mut shard = self.tasks.write(key);
        let old = shard.remove(key)?;
        self.unlink(key, Some(&old), None);
        Some(old)
    }

    fn unlink(&self, key: &TaskKey, old: Option<&TaskData>, new: Option<&TaskData>) {
        let Some(old) = old else {
            return;
        };

        for dep in &old.task_requires {
            let kept = new.is_some_and(|new| new.task_requires.iter().any(|n| n.callee == dep.callee));
            if !kept {
                self.callers
                    .update(&dep.callee, |set| _ = set.remove(key), HashSet::is_empty);
            }
        }

        for dep in &old.resource_requires {
            let kept = new.is_some_and(|new| new.resource_requires.iter().any(|n| n.key == dep.key));
            if !kept {
                self.requirees
                    .update(&dep.key, |set| _ = set.remove(key), HashSet::is_empty);
            }
        }

        for dep in &old.resource_provides {
            let kept = new.is_some_and(|new| new.resource_provides.iter().any(|n| n.key == dep.key));
            if !kept {
                let mut shard = self.providers.write(&dep.key);
                if shard.get(&dep.key) == Some(key) {
                    shard.remove(&dep.key);
                }
            }
        }
    }

    fn link(&self, key: &TaskKey, new: &TaskData) {
        for dep in &new.task_requires {
            self.callers
                .update(&dep.callee, |set| _ = set.insert(key.clone()), HashSet::is_empty);
        }

        for dep in &new.resource_requires {
            self.requirees
                .update(&dep.key, |set| _ = set.insert(key.clone()), HashSet::is_empty);
        }

        for dep in &new.resource_provides {
            self.providers.insert(dep.key.clone(), key.clone());
        }
    }

    /// Whether `caller` requires `callee` through one or more task require
    /// edges. A task does not require itself unless it records an edge to
    /// itself.
    pub fn does_require_transitively(&self, caller: &TaskKey, callee: &TaskKey) -> bool {
        self.reaches(self.task_requires(caller).into_iter().map(|dep| dep.callee), callee)
    }

    /// Whether `target` is one of `roots` or is transitively required by one
    /// of them.
    pub(crate) fn reaches(&self, roots: impl IntoIterator<Item = TaskKey>, target: &TaskKey) -> bool {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<TaskKey> = roots.into_iter().collect();

        while let Some(key) = queue.pop_front() {
            if &key == target {
                return true;
            }
            if !seen.insert(key.clone()) {
                continue;
            }
            queue.extend(self.task_requires(&key).into_iter().map(|dep| dep.callee));
        }

        false
    }

    /// Number of resources that are read by some task but written by none.
    pub fn num_source_resources(&self) -> usize {
        self.requirees
            .keys()
            .iter()
            .filter(|resource| !self.providers.contains(resource))
            .count()
    }

    /// Every stored task key, in key order.
    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys = self.tasks.keys();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.tasks.clear();
        self.callers.clear();
        self.requirees.clear();
        self.providers.clear();
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut tasks = self.tasks.entries();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        Snapshot { tasks }
    }

    /// Rebuilds a store, including its reverse indexes, from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        for (key, data) in snapshot.tasks {
            store.set_data(&key, data);
        }
        store
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("tasks", &self.len())
            .field("source_resources", &self.num_source_resources())
            .finish()
    }
}

fn sorted(set: Option<HashSet<TaskKey>>) -> Vec<TaskKey> {
    let mut keys: Vec<_> = set.into_iter().flatten().collect();
    keys.sort();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash32;
    use crate::stamp::{OutputStamper, ResourceStamp, ResourceStamper, StampValue};

    fn key(id: &str) -> TaskKey {
        TaskKey::from_parts(id, Hash32::default())
    }

    fn require(callee: &str) -> TaskRequireDep {
        TaskRequireDep {
            callee: key(callee),
            stamp: crate::stamp::OutputStamp {
                stamper: OutputStamper::Inconsequential,
                value: Value::Null,
            },
        }
    }

    fn stamp() -> ResourceStamp {
        ResourceStamp {
            stamper: ResourceStamper::Exists,
            value: StampValue::Exists(true),
        }
    }

    fn data(
        task_requires: &[&str],
        resource_requires: &[&str],
        resource_provides: &[&str],
    ) -> TaskData {
        TaskData {
            input: Value::Null,
            output: Output::new(Value::Null),
            task_requires: task_requires.iter().map(|c| require(c)).collect(),
            resource_requires: resource_requires
                .iter()
                .map(|r| ResourceRequireDep {
                    key: (*r).into(),
                    stamp: stamp(),
                })
                .collect(),
            resource_provides: resource_provides
                .iter()
                .map(|r| ResourceProvideDep {
                    key: (*r).into(),
                    stamp: stamp(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_reverse_indexes_follow_forward_data() {
        let store = Store::new();
        store.set_data(&key("a"), data(&["b"], &["in.txt"], &["out.txt"]));

        assert_eq!(store.callers_of(&key("b")), vec![key("a")]);
        assert_eq!(store.requirees_of(&"in.txt".into()), vec![key("a")]);
        assert_eq!(store.provider_of(&"out.txt".into()), Some(key("a")));

        // Re-execution replaces the edges instead of merging them.
        store.set_data(&key("a"), data(&["c"], &["other.txt"], &[]));

        assert!(store.callers_of(&key("b")).is_empty());
        assert_eq!(store.callers_of(&key("c")), vec![key("a")]);
        assert!(store.requirees_of(&"in.txt".into()).is_empty());
        assert_eq!(store.requirees_of(&"other.txt".into()), vec![key("a")]);
        assert_eq!(store.provider_of(&"out.txt".into()), None);
    }

    #[test]
    fn test_delete_keeps_incoming_edges() {
        let store = Store::new();
        store.set_data(&key("a"), data(&["b"], &[], &[]));
        store.set_data(&key("b"), data(&[], &["in.txt"], &[]));

        store.delete_data(&key("b"));

        assert!(store.data(&key("b")).is_none());
        assert_eq!(store.callers_of(&key("b")), vec![key("a")]);
        assert!(store.requirees_of(&"in.txt".into()).is_empty());
    }

    #[test]
    fn test_transitive_requires() {
        let store = Store::new();
        store.set_data(&key("a"), data(&["b"], &[], &[]));
        store.set_data(&key("b"), data(&["c"], &[], &[]));
        store.set_data(&key("c"), data(&[], &[], &[]));

        assert!(store.does_require_transitively(&key("a"), &key("c")));
        assert!(!store.does_require_transitively(&key("c"), &key("a")));
        assert!(!store.does_require_transitively(&key("a"), &key("a")));
    }

    #[test]
    fn test_transitive_requires_terminates_on_cycles() {
        let store = Store::new();
        store.set_data(&key("a"), data(&["b"], &[], &[]));
        store.set_data(&key("b"), data(&["a"], &[], &[]));

        assert!(store.does_require_transitively(&key("a"), &key("a")));
        assert!(!store.does_require_transitively(&key("a"), &key("z")));
    }

    #[test]
    fn test_source_resources() {
        let store = Store::new();
        store.set_data(&key("gen"), data(&[], &[], &["gen.txt"]));
        store.set_data(&key("use"), data(&["gen"], &["gen.txt", "src.txt"], &[]));

        assert_eq!(store.num_source_resources(), 1);
    }

    #[test]
    fn test_snapshot_rebuilds_indexes() {
        let store = Store::new();
        store.set_data(&key("a"), data(&["b"], &["in.txt"], &[]));
        store.set_data(&key("b"), data(&[], &[], &["in.txt"]));

        let restored = Store::from_snapshot(store.snapshot());

        assert_eq!(restored.keys(), vec![key("a"), key("b")]);
        assert_eq!(restored.callers_of(&key("b")), vec![key("a")]);
        assert_eq!(restored.provider_of(&"in.txt".into()), Some(key("b")));

        restored.clear();
        assert!(restored.is_empty());
        assert!(restored.callers_of(&key("b")).is_empty());
    }

    #[test]
    fn test_concurrent_commits() {
        let store = Store::new();
        std::thread::scope(|s| {
            for i in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for j in 0..50 {
                        let caller = key(&format!("t{i}-{j}"));
                        store.set_data(&caller, data(&["shared"], &["shared.txt"], &[]));
                    }
                });
            }
        });

        assert_eq!(store.callers_of(&key("shared")).len(), 400);
        assert_eq!(store.requirees_of(&"shared.txt".into()).len(), 400);
    }
}
