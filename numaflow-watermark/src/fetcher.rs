//! Fetcher is the reading side of the watermark store. It keeps an [OffsetTimeline] for every
//! (processor, partition) it has seen, first by reading everything already in the store and then
//! by following the store's watch stream in a background task.
//!
//! A record that cannot be decoded is corrupt, it is logged and skipped. The timeline keeps the
//! previous value, nothing is substituted.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::{store_labels, watermark_metrics};
use crate::store::{KVEntry, KVWatchOp, KVWatchStream, OTKey, WatermarkStore};
use crate::timeline::OffsetTimeline;
use crate::wmb::WMB;

const DEFAULT_TIMELINE_CAPACITY: usize = 10;

/// Timelines of one processor, keyed by partition.
type Timelines = HashMap<u16, OffsetTimeline>;

/// WatermarkFetcher exposes the watermark of an edge, computed from the WMBs of all the
/// processors that publish to it.
pub struct WatermarkFetcher {
    store_name: String,
    processors: Arc<RwLock<HashMap<String, Timelines>>>,
    watch_handle: JoinHandle<()>,
}

impl std::fmt::Debug for WatermarkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let processors = self.processors.read();
        let mut names: Vec<&String> = processors.keys().collect();
        names.sort();
        f.debug_struct("WatermarkFetcher")
            .field("store", &self.store_name)
            .field("processors", &names)
            .finish()
    }
}

impl Drop for WatermarkFetcher {
    fn drop(&mut self) {
        self.watch_handle.abort();
    }
}

impl WatermarkFetcher {
    /// Creates a fetcher for the store, prepopulated with what is already in the store.
    pub async fn new(store: Arc<dyn WatermarkStore>) -> Result<Self> {
        let store_name = store.name().to_string();
        let processors = Arc::new(RwLock::new(HashMap::new()));

        // watch before listing so nothing written in between is lost, replaying a put is harmless
        let watcher = store.watch().await?;

        for key in store.keys().await? {
            if let Some(value) = store.get(&key).await? {
                apply_entry(
                    &processors,
                    &store_name,
                    KVEntry {
                        key,
                        value,
                        operation: KVWatchOp::Put,
                    },
                );
            }
        }

        info!(store = %store_name, processors = processors.read().len(), "Watermark fetcher prepopulated");

        let watch_handle = tokio::spawn(watch_ot(
            watcher,
            Arc::clone(&processors),
            store_name.clone(),
        ));

        Ok(WatermarkFetcher {
            store_name,
            processors,
            watch_handle,
        })
    }

    /// Watermark for the offset read from the partition, the minimum across processors of the
    /// event time of the nearest WMB before the offset. -1 when nothing is known yet.
    pub fn fetch_watermark(&self, offset: i64, partition: u16) -> i64 {
        let processors = self.processors.read();
        processors
            .values()
            .filter_map(|timelines| timelines.get(&partition))
            .map(|timeline| timeline.event_time(offset))
            .min()
            .unwrap_or(-1)
    }

    /// Minimum of the head watermarks across the processors publishing to the partition.
    pub fn fetch_head_watermark(&self, partition: u16) -> i64 {
        let processors = self.processors.read();
        processors
            .values()
            .filter_map(|timelines| timelines.get(&partition))
            .map(OffsetTimeline::head_watermark)
            .filter(|wm| *wm != -1)
            .min()
            .unwrap_or(-1)
    }

    /// Head idle WMB of the partition, the idle head with the lowest watermark, but only if every
    /// processor publishing to the partition is idling.
    pub fn fetch_head_idle_wmb(&self, partition: u16) -> Option<WMB> {
        let processors = self.processors.read();
        let mut min_wmb: Option<WMB> = None;

        for timeline in processors.values().filter_map(|t| t.get(&partition)) {
            let head = timeline.head_wmb().filter(|wmb| wmb.idle)?;
            match min_wmb {
                Some(current) if current.watermark <= head.watermark => {}
                _ => min_wmb = Some(head),
            }
        }
        min_wmb
    }

    /// Head offset the processor published for the partition.
    pub fn fetch_head_offset(&self, processor: &str, partition: u16) -> Option<i64> {
        self.processors
            .read()
            .get(processor)
            .and_then(|timelines| timelines.get(&partition))
            .map(OffsetTimeline::head_offset)
    }

    pub fn processor_count(&self) -> usize {
        self.processors.read().len()
    }
}

/// Follows the watch stream until the store closes it.
async fn watch_ot(
    mut watcher: KVWatchStream,
    processors: Arc<RwLock<HashMap<String, Timelines>>>,
    store_name: String,
) {
    while let Some(entry) = watcher.next().await {
        apply_entry(&processors, &store_name, entry);
    }
    warn!(store = %store_name, "OT watcher stopped");
}

fn apply_entry(
    processors: &RwLock<HashMap<String, Timelines>>,
    store_name: &str,
    entry: KVEntry,
) {
    let key = match entry.key.parse::<OTKey>() {
        Ok(key) => key,
        Err(e) => {
            warn!(store = %store_name, error = ?e, "Ignoring entry with unknown key");
            return;
        }
    };

    match entry.operation {
        KVWatchOp::Put => {
            let Some(wmb) = decode_wmb(store_name, &key, &entry.value) else {
                return;
            };
            let mut processors = processors.write();
            if !processors.contains_key(&key.processor) {
                info!(store = %store_name, processor = %key.processor, "Adding new processor");
            }
            processors
                .entry(key.processor)
                .or_default()
                .entry(key.partition)
                .or_insert_with(|| OffsetTimeline::new(DEFAULT_TIMELINE_CAPACITY))
                .put(wmb);
        }
        KVWatchOp::Delete => {
            let mut processors = processors.write();
            if let Some(timelines) = processors.get_mut(&key.processor) {
                timelines.remove(&key.partition);
                if timelines.is_empty() {
                    processors.remove(&key.processor);
                    info!(store = %store_name, processor = %key.processor, "Removed processor");
                }
            }
        }
    }
}

fn decode_wmb(store_name: &str, key: &OTKey, value: &Bytes) -> Option<WMB> {
    match WMB::decode(value) {
        Ok(wmb) => {
            debug!(store = %store_name, %key, ?wmb, "Received WMB");
            Some(wmb)
        }
        Err(e) => {
            error!(store = %store_name, %key, error = ?e, "Corrupt WMB, skipping");
            watermark_metrics()
                .corrupt_wmb
                .get_or_create(&store_labels(store_name))
                .inc();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::memory::InMemoryStore;

    fn wmb(idle: bool, offset: i64, watermark: i64) -> WMB {
        WMB {
            idle,
            offset,
            watermark,
        }
    }

    async fn put(store: &InMemoryStore, processor: &str, partition: u16, wmb: WMB) {
        store
            .put(&OTKey::new(processor, partition).to_string(), wmb.encode())
            .await
            .unwrap();
    }

    /// Polls until the condition holds, the watcher applies changes asynchronously.
    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_prepopulate_from_store() {
        let store = InMemoryStore::new("ot");
        put(&store, "p1", 0, wmb(false, 10, 1000)).await;
        put(&store, "p2", 0, wmb(false, 12, 800)).await;

        let fetcher = WatermarkFetcher::new(Arc::new(store.clone())).await.unwrap();
        assert_eq!(fetcher.processor_count(), 2);
        assert_eq!(fetcher.fetch_head_watermark(0), 800);
        assert_eq!(fetcher.fetch_head_offset("p1", 0), Some(10));
        // nothing on partition 1
        assert_eq!(fetcher.fetch_head_watermark(1), -1);
    }

    #[tokio::test]
    async fn test_fetch_watermark_follows_watch() {
        let store = InMemoryStore::new("ot");
        let fetcher = WatermarkFetcher::new(Arc::new(store.clone())).await.unwrap();
        assert_eq!(fetcher.fetch_watermark(100, 0), -1);

        put(&store, "p1", 0, wmb(false, 1, 100)).await;
        put(&store, "p1", 0, wmb(false, 5, 200)).await;
        put(&store, "p2", 0, wmb(false, 2, 150)).await;
        put(&store, "p2", 0, wmb(false, 6, 300)).await;
        eventually(|| fetcher.fetch_head_offset("p2", 0) == Some(6)).await;
        assert_eq!(fetcher.fetch_head_watermark(0), 200);

        // p1 -> 200 (offset 5), p2 -> 150 (offset 2)
        assert_eq!(fetcher.fetch_watermark(6, 0), 150);
        // p1 -> 200, p2 -> 300
        assert_eq!(fetcher.fetch_watermark(7, 0), 200);
        // p2 has nothing before offset 2
        assert_eq!(fetcher.fetch_watermark(2, 0), -1);
    }

    #[tokio::test]
    async fn test_fetch_head_idle_wmb() {
        let store = InMemoryStore::new("ot");
        let fetcher = WatermarkFetcher::new(Arc::new(store.clone())).await.unwrap();
        assert_eq!(fetcher.fetch_head_idle_wmb(0), None);

        put(&store, "p1", 0, wmb(true, 10, 1000)).await;
        put(&store, "p2", 0, wmb(false, 20, 900)).await;
        eventually(|| fetcher.processor_count() == 2).await;
        // p2 is active
        assert_eq!(fetcher.fetch_head_idle_wmb(0), None);

        put(&store, "p2", 0, wmb(true, 20, 900)).await;
        eventually(|| fetcher.fetch_head_idle_wmb(0).is_some()).await;
        assert_eq!(fetcher.fetch_head_idle_wmb(0), Some(wmb(true, 20, 900)));

        // p1 gets data again
        put(&store, "p1", 0, wmb(false, 11, 1100)).await;
        eventually(|| fetcher.fetch_head_idle_wmb(0).is_none()).await;
    }

    #[tokio::test]
    async fn test_corrupt_wmb_is_skipped() {
        let store = InMemoryStore::new("corrupt-ot");
        let fetcher = WatermarkFetcher::new(Arc::new(store.clone())).await.unwrap();

        put(&store, "p1", 0, wmb(false, 10, 1000)).await;
        eventually(|| fetcher.fetch_head_watermark(0) == 1000).await;

        store
            .put("p1/0", Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .await
            .unwrap();
        store
            .put("not-a-key", wmb(false, 1, 1).encode())
            .await
            .unwrap();
        put(&store, "p1", 0, wmb(false, 11, 1200)).await;
        eventually(|| fetcher.fetch_head_watermark(0) == 1200).await;

        assert_eq!(fetcher.processor_count(), 1);
    }

    #[tokio::test]
    async fn test_deleted_processor_is_removed() {
        let store = InMemoryStore::new("ot");
        let fetcher = WatermarkFetcher::new(Arc::new(store.clone())).await.unwrap();

        put(&store, "p1", 0, wmb(false, 10, 1000)).await;
        put(&store, "p2", 0, wmb(false, 10, 500)).await;
        eventually(|| fetcher.processor_count() == 2).await;
        assert_eq!(fetcher.fetch_head_watermark(0), 500);

        store.delete("p2/0").await.unwrap();
        eventually(|| fetcher.processor_count() == 1).await;
        assert_eq!(fetcher.fetch_head_watermark(0), 1000);
    }
}
