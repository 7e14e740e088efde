// Entity caches: thread-safe keyed stores of ledger entities

mod assets;
mod requirements;

pub use assets::AssetsCache;
pub use requirements::{ReadingsRequest, RequirementsCache, Subscription};

use crate::model::Asset;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Entity with a stable cache key
pub trait CacheEntity: Clone + Send {
    fn cache_id(&self) -> &str;
}

impl CacheEntity for Asset {
    fn cache_id(&self) -> &str {
        &self.id
    }
}

/// Keyed store guarded by one exclusive lock.
///
/// Every read and mutation holds the lock for its whole duration, so no
/// caller ever observes a partially applied change.
pub struct EntityCache<T: CacheEntity> {
    data: Mutex<HashMap<String, T>>,
}

impl<T: CacheEntity> EntityCache<T> {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, T>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `entity`, returning the entry it replaced.
    pub fn put(&self, entity: T) -> Option<T> {
        self.lock().insert(entity.cache_id().to_string(), entity)
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).cloned()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn values(&self) -> Vec<T> {
        self.lock().values().cloned().collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain().map(|(_, v)| v).collect()
    }
}

impl<T: CacheEntity> Default for EntityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
