use std::collections::BTreeSet;

use crate::store::Store;
use crate::task::TaskKey;

/// Tasks scheduled by a bottom-up build, polled in dependency order: a task
/// is only handed out once no other scheduled task is one of its transitive
/// callees.
#[derive(Debug, Default)]
pub(crate) struct Queue {
    set: BTreeSet<TaskKey>,
}

impl Queue {
    /// Schedules `key`. Scheduling a key twice keeps one entry.
    pub fn add(&mut self, key: TaskKey) -> bool {
        self.set.insert(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Removes and returns the first scheduled task that does not depend on
    /// any other scheduled task.
    pub fn poll(&mut self, store: &Store) -> Option<TaskKey> {
        let key = least(self.set.iter(), store)?;
        self.set.remove(&key);
        Some(key)
    }

    /// Removes and returns the least scheduled task among `key` and the
    /// tasks `key` transitively requires, if any of them is scheduled.
    pub fn poll_least_with_dep_to(&mut self, key: &TaskKey, store: &Store) -> Option<TaskKey> {
        let candidates = self
            .set
            .iter()
            .filter(|other| *other == key || store.does_require_transitively(key, other));
        let least = least(candidates, store)?;
        self.set.remove(&least);
        Some(least)
    }
}

/// The first of `keys` that requires none of the others. Falls back to the
/// first key when every key is part of a cycle.
fn least<'a>(keys: impl Iterator<Item = &'a TaskKey>, store: &Store) -> Option<TaskKey> {
    let keys: Vec<&TaskKey> = keys.collect();
    let first = keys.first()?;

    let found = keys.iter().find(|key| {
        !keys
            .iter()
            .any(|other| other != *key && store.does_require_transitively(key, other))
    });

    Some((*found.unwrap_or(first)).clone())
}
