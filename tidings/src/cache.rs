use async_trait::async_trait;
use dyn_clone::DynClone;
use parking_lot::RwLock;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};

#[async_trait]
pub trait Cache: DynClone + Send + Sync {
    async fn invalidate(&self, keys: &[String]) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(Cache);

#[derive(Debug, Clone, Default)]
pub struct MemoryCache(Arc<RwLock<HashMap<String, Value>>>);

impl MemoryCache {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.write().insert(key.into(), value);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn invalidate(&self, keys: &[String]) -> anyhow::Result<()> {
        let mut entries = self.0.write();

        for key in keys {
            entries.remove(key);
        }

        Ok(())
    }
}

/// Wraps a command call and invalidates cache keys once it succeeded.
pub struct CacheInvalidation<'a> {
    cache: &'a dyn Cache,
    keys: Vec<String>,
}

impl<'a> CacheInvalidation<'a> {
    pub fn new<K: Into<String>>(cache: &'a dyn Cache, keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            cache,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub async fn run<T, E, F>(self, command: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let value = command.await?;

        if let Err(e) = self.cache.invalidate(&self.keys).await {
            tracing::error!("failed to invalidate {:?}: {e}", self.keys);
        }

        Ok(value)
    }
}
