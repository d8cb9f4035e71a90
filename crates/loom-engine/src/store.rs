use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use loom_core::error::{LoomError, Result};
use loom_core::traits::StateStore;

/// In-process [`StateStore`]. Writes between `close` and the next `open` are rejected.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, serde_json::Value>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StateStore for MemoryStore {
    fn put(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        Box::pin(async move {
            if self.is_closed() {
                return Err(LoomError::Storage(format!("store closed, cannot write '{}'", key)));
            }
            self.entries.write().await.insert(key, value);
            Ok(())
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.entries.read().await.get(&key).cloned()) })
    }

    fn open(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(false, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
