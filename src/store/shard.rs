use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, RandomState};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const SHARDS: usize = 32;

/// A hash map split into independently locked shards, so that writers touching
/// unrelated keys do not serialize on one lock.
pub(crate) struct Sharded<K, V> {
    hasher: RandomState,
    shards: Box<[RwLock<HashMap<K, V>>]>,
}

impl<K, V> Default for Sharded<K, V> {
    fn default() -> Self {
        Self {
            hasher: RandomState::new(),
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }
}

impl<K, V> Sharded<K, V>
where
    K: Hash + Eq + Clone,
{
    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    pub fn read(&self, key: &K) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.shard(key).read()
    }

    pub fn write(&self, key: &K) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.shard(key).write()
    }

    pub fn get_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.read(key).get(key).map(f)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read(key).contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.write(&key).insert(key, value)
    }

    /// Applies `f` to the entry of `key`, creating it with `V::default()` if
    /// missing, and removes the entry again when `f` leaves it empty.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V), is_empty: impl FnOnce(&V) -> bool)
    where
        V: Default,
    {
        let mut shard = self.write(key);
        let value = shard.entry(key.clone()).or_default();
        f(value);
        if is_empty(value) {
            shard.remove(key);
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}
