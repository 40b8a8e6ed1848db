//! In-memory [WatermarkStore]. Changes are fanned out to watchers over a broadcast channel, a
//! watcher that falls behind by more than the channel capacity loses the oldest changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::error::Result;
use crate::store::{KVEntry, KVWatchOp, KVWatchStream, WatermarkStore};

const DEFAULT_WATCH_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct InMemoryStore {
    name: String,
    data: Arc<RwLock<HashMap<String, Bytes>>>,
    watch_tx: broadcast::Sender<KVEntry>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("name", &self.name)
            .field("keys", &self.data.read().len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_watch_capacity(name, DEFAULT_WATCH_CAPACITY)
    }

    pub fn with_watch_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (watch_tx, _) = broadcast::channel(capacity);
        InMemoryStore {
            name: name.into(),
            data: Arc::new(RwLock::new(HashMap::new())),
            watch_tx,
        }
    }

    fn notify(&self, key: &str, value: Bytes, operation: KVWatchOp) {
        // no receivers is not an error, nobody is watching yet
        let _ = self.watch_tx.send(KVEntry {
            key: key.to_string(),
            value,
            operation,
        });
    }
}

#[async_trait]
impl WatermarkStore for InMemoryStore {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.data.write().insert(key.to_string(), value.clone());
        self.notify(key, value, KVWatchOp::Put);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.data.write().remove(key).is_some() {
            self.notify(key, Bytes::new(), KVWatchOp::Delete);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn watch(&self) -> Result<KVWatchStream> {
        let name = self.name.clone();
        let stream = BroadcastStream::new(self.watch_tx.subscribe()).filter_map(move |entry| {
            match entry {
                Ok(entry) => Some(entry),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(store = %name, skipped, "Watcher lagged behind, changes dropped");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
