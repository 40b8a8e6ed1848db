//! Watermark store is where the processors exchange encoded [WMB](crate::wmb::WMB)s across process
//! boundaries. Every processor owns one key per partition it publishes to, the value is the
//! latest encoded WMB for that partition.
//!
//! The trait uses `async_trait` so it stays object safe and can be shared as
//! `Arc<dyn WatermarkStore>`.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::{Error, Result};

/// In-memory store, used by tests and single process pipelines.
pub mod memory;

/// Operation that produced a [KVEntry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KVWatchOp {
    Put,
    Delete,
}

/// A single change observed on the store.
#[derive(Debug, Clone)]
pub struct KVEntry {
    pub key: String,
    /// Empty for deletes.
    pub value: Bytes,
    pub operation: KVWatchOp,
}

pub type KVWatchStream = Pin<Box<dyn Stream<Item = KVEntry> + Send>>;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// All the keys currently in the store.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Returns `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Name of the bucket.
    fn name(&self) -> &str;

    /// Stream of the changes made after the watch was created.
    async fn watch(&self) -> Result<KVWatchStream>;
}

/// Key of a processor's offset-timeline entry for one partition, rendered as
/// `<processor>/<partition>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OTKey {
    pub processor: String,
    pub partition: u16,
}

impl OTKey {
    pub fn new(processor: impl Into<String>, partition: u16) -> Self {
        OTKey {
            processor: processor.into(),
            partition,
        }
    }
}

impl fmt::Display for OTKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.processor, self.partition)
    }
}

impl FromStr for OTKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        // processor names may contain '/', the partition is always the last segment
        let (processor, partition) = key
            .rsplit_once('/')
            .ok_or_else(|| Error::Store(format!("invalid OT key {key}")))?;

        if processor.is_empty() {
            return Err(Error::Store(format!("OT key {key} has no processor")));
        }

        let partition = partition
            .parse::<u16>()
            .map_err(|e| Error::Store(format!("invalid partition in OT key {key}: {e}")))?;

        Ok(OTKey::new(processor, partition))
    }
}
