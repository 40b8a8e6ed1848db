//! Publisher writes the [WMB]s of one processor entity into the watermark store, one key per
//! partition. It remembers the head WMB it published for each partition so that watermarks never
//! regress and idle reports repeat the same `(offset, watermark)` until there is progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{OTKey, WatermarkStore};
use crate::wmb::WMB;

/// WatermarkPublisher publishes the watermarks of a single processor.
pub struct WatermarkPublisher {
    processor: String,
    store: Arc<dyn WatermarkStore>,
    partitions: u16,
    /// only set for source publishers, watermark originates at source.
    max_delay: Option<Duration>,
    head_wmbs: HashMap<u16, WMB>,
}

impl std::fmt::Debug for WatermarkPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkPublisher")
            .field("processor", &self.processor)
            .field("store", &self.store.name())
            .field("partitions", &self.partitions)
            .field("head_wmbs", &self.head_wmbs)
            .finish()
    }
}

impl WatermarkPublisher {
    /// Creates a publisher for an edge with `partitions` partitions.
    pub fn new(
        processor: impl Into<String>,
        store: Arc<dyn WatermarkStore>,
        partitions: u16,
    ) -> Self {
        WatermarkPublisher {
            processor: processor.into(),
            store,
            partitions,
            max_delay: None,
            head_wmbs: HashMap::new(),
        }
    }

    /// Creates a publisher for a source. Sources publish within themselves so there is a single
    /// partition, and every non-idle watermark is held back by `max_delay`.
    pub fn source(
        processor: impl Into<String>,
        store: Arc<dyn WatermarkStore>,
        max_delay: Duration,
    ) -> Self {
        WatermarkPublisher {
            max_delay: Some(max_delay),
            ..Self::new(processor, store, 1)
        }
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn partitions(&self) -> u16 {
        self.partitions
    }

    /// The last WMB published for the partition.
    pub fn head_wmb(&self, partition: u16) -> Option<WMB> {
        self.head_wmbs.get(&partition).copied()
    }

    /// Publishes the watermark for the partition. A watermark lower than the head is skipped.
    /// When the offset is not known (sources don't track it) the current time in micros is used.
    pub async fn publish_watermark(
        &mut self,
        mut watermark: i64,
        offset: Option<i64>,
        partition: u16,
    ) -> Result<()> {
        self.validate_partition(partition)?;

        if let Some(max_delay) = self.max_delay
            && watermark != -1
        {
            watermark -= max_delay.as_millis() as i64;
        }

        let head = self.head_wmb(partition);
        if let Some(head) = head
            && watermark < head.watermark
        {
            debug!(
                processor = %self.processor,
                partition,
                watermark,
                head_watermark = head.watermark,
                "New watermark is lower than the head watermark, skipping"
            );
            return Ok(());
        }

        let wmb = WMB {
            idle: false,
            offset: offset.unwrap_or_else(|| Utc::now().timestamp_micros()),
            watermark,
        };
        self.write(partition, wmb).await
    }

    /// Publishes an idle watermark for the partition. While the partition stays idle and the
    /// watermark doesn't move forward, the head `(offset, watermark)` is repeated as is.
    pub async fn publish_idle_watermark(
        &mut self,
        watermark: i64,
        offset: Option<i64>,
        partition: u16,
    ) -> Result<()> {
        self.validate_partition(partition)?;

        let wmb = match self.head_wmb(partition) {
            Some(head) if head.idle && watermark <= head.watermark => head,
            Some(head) if watermark < head.watermark => {
                warn!(
                    processor = %self.processor,
                    partition,
                    watermark,
                    head_watermark = head.watermark,
                    "Idle watermark is lower than the head watermark, using the head watermark"
                );
                WMB {
                    idle: true,
                    offset: offset.unwrap_or(head.offset),
                    watermark: head.watermark,
                }
            }
            Some(head) => WMB {
                idle: true,
                offset: offset.unwrap_or(head.offset),
                watermark,
            },
            None => WMB {
                idle: true,
                offset: offset.unwrap_or_else(|| Utc::now().timestamp_micros()),
                watermark,
            },
        };
        self.write(partition, wmb).await
    }

    /// Removes the processor's entries from the store, fetchers drop the processor once they see
    /// the deletes.
    pub async fn close(&mut self) -> Result<()> {
        for partition in self.head_wmbs.keys() {
            let key = OTKey::new(self.processor.as_str(), *partition).to_string();
            self.store.delete(&key).await?;
        }
        self.head_wmbs.clear();
        info!(processor = %self.processor, "Closed watermark publisher");
        Ok(())
    }

    async fn write(&mut self, partition: u16, wmb: WMB) -> Result<()> {
        let key = OTKey::new(self.processor.as_str(), partition).to_string();
        self.store.put(&key, wmb.encode()).await?;
        debug!(processor = %self.processor, partition, ?wmb, "Published WMB");
        self.head_wmbs.insert(partition, wmb);
        Ok(())
    }

    fn validate_partition(&self, partition: u16) -> Result<()> {
        if partition >= self.partitions {
            return Err(Error::Watermark(format!(
                "partition {partition} out of range, publisher {} has {} partitions",
                self.processor, self.partitions
            )));
        }
        Ok(())
    }
}
