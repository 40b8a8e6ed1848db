//! The head idle WMB read from the fetcher is only a snapshot. Processors publish independently,
//! so a single read can show everybody idle while one of them has already moved on. The propagator
//! therefore feeds every snapshot to a [WMBChecker] and only publishes the idle watermark
//! downstream once the same idle head was seen `required_matches` times in a row.

use std::collections::HashMap;

use tracing::info;

use crate::error::Result;
use crate::fetcher::WatermarkFetcher;
use crate::metrics::{Labels, vertex_labels, watermark_metrics};
use crate::publisher::WatermarkPublisher;
use crate::wmb::{WMB, WMBChecker};

/// Stands in for the head when some processor is still active.
const ACTIVE_HEAD: WMB = WMB {
    idle: false,
    offset: -1,
    watermark: -1,
};

/// IdleWatermarkPropagator owns one [WMBChecker] per upstream partition it reads from.
#[derive(Debug)]
pub struct IdleWatermarkPropagator {
    required_matches: usize,
    checkers: HashMap<u16, WMBChecker>,
    labels: Labels,
}

impl IdleWatermarkPropagator {
    pub fn new(required_matches: usize, vertex: &str, pipeline: &str) -> Self {
        IdleWatermarkPropagator {
            required_matches,
            checkers: HashMap::new(),
            labels: vertex_labels(vertex, pipeline),
        }
    }

    /// Samples the head idle WMB of `from_partition` and, once it converged, publishes it as an
    /// idle watermark to every partition in `to_partitions`. Returns true if an idle watermark
    /// was published.
    pub async fn propagate(
        &mut self,
        fetcher: &WatermarkFetcher,
        from_partition: u16,
        publisher: &mut WatermarkPublisher,
        to_partitions: &[u16],
    ) -> Result<bool> {
        let head = fetcher
            .fetch_head_idle_wmb(from_partition)
            .unwrap_or(ACTIVE_HEAD);

        let required_matches = self.required_matches;
        let checker = self
            .checkers
            .entry(from_partition)
            .or_insert_with(|| WMBChecker::new(required_matches));

        if !checker.validate_head_wmb(head) {
            return Ok(false);
        }

        // offsets of the upstream partition mean nothing downstream, the publisher keeps its own
        for to_partition in to_partitions {
            publisher
                .publish_idle_watermark(head.watermark, None, *to_partition)
                .await?;
        }

        watermark_metrics()
            .idle_wm_propagated
            .get_or_create(&self.labels)
            .inc();
        info!(
            from_partition,
            ?to_partitions,
            watermark = head.watermark,
            "Propagated idle watermark"
        );
        Ok(true)
    }

    /// Matches recorded so far for the partition.
    pub fn counter(&self, from_partition: u16) -> usize {
        self.checkers
            .get(&from_partition)
            .map_or(0, WMBChecker::counter)
    }
}
