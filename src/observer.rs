use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::Output;
use crate::task::TaskKey;

type Observer = Arc<dyn Fn(&Output) + Send + Sync>;

/// Callbacks keyed by task key, invoked by bottom-up builds when the output of
/// the observed task changes. At most one observer exists per key.
#[derive(Clone, Default)]
pub struct Observers {
    map: Arc<RwLock<HashMap<TaskKey, Observer>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes `key`, replacing any previous observer of it.
    pub fn set<F>(&self, key: TaskKey, observer: F)
    where
        F: Fn(&Output) + Send + Sync + 'static,
    {
        self.map.write().insert(key, Arc::new(observer));
    }

    pub fn remove(&self, key: &TaskKey) -> bool {
        self.map.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls the observer of `key`, if any. The lock is released before the
    /// call, so an observer may itself add or remove observers.
    pub(crate) fn notify(&self, key: &TaskKey, output: &Output) -> bool {
        let observer = self.map.read().get(key).cloned();
        match observer {
            Some(observer) => {
                tracing::debug!(key = %key, "notifying observer");
                observer(output);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::{Hash32, Value};

    #[test]
    fn test_set_replaces() {
        let observers = Observers::new();
        let key = TaskKey::from_parts("a", Hash32::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        observers.set(key.clone(), move |_| _ = counter.fetch_add(1, Ordering::SeqCst));
        let counter = second.clone();
        observers.set(key.clone(), move |_| _ = counter.fetch_add(1, Ordering::SeqCst));

        assert!(observers.notify(&key, &Output::new(Value::Null)));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(observers.remove(&key));
        assert!(!observers.notify(&key, &Output::new(Value::Null)));
        assert!(observers.is_empty());
    }
}
