//! Source forwarder reads from the source, publishes the source watermarks and forwards the
//! watermark of the source to the downstream edge. When the source has nothing to read it takes
//! care of idling, the source publishes idle watermarks into its own store and, once every
//! processor of the source agreed on the same idle head, the idle watermark is propagated to the
//! downstream edge.
//!
//! The fetcher follows the source store asynchronously. A batch whose watermark is not visible
//! yet stays pending and its edge watermark is published on the next read. An idle watermark is
//! held at the source until it was propagated, otherwise every step would move the head the
//! propagator is trying to converge on.

use chrono::DateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::Result;
use crate::fetcher::WatermarkFetcher;
use crate::idle::{IdleWatermarkPropagator, SourceIdleDetector};
use crate::message::{Offset, ReadMessage};
use crate::metrics::{Labels, vertex_labels, watermark_metrics};
use crate::publisher::WatermarkPublisher;
use crate::source::Source;

/// SourceForwarder drives a [Source] until it is cancelled.
pub struct SourceForwarder<S: Source> {
    source: S,
    read_batch_size: usize,
    idle_detector: Option<SourceIdleDetector>,
    /// fetches the watermark of the source from the source offset-timeline store
    fetcher: WatermarkFetcher,
    /// publishes to the downstream edge
    edge_publisher: WatermarkPublisher,
    propagator: IdleWatermarkPropagator,
    to_partitions: Vec<u16>,
    /// offset of the last batch whose watermark has not reached the edge yet
    pending_offset: Option<i64>,
    /// idle watermark published at the source and not propagated yet
    held_idle_wm: Option<i64>,
    labels: Labels,
}

impl<S: Source> SourceForwarder<S> {
    pub fn new(
        source: S,
        settings: &Settings,
        fetcher: WatermarkFetcher,
        edge_publisher: WatermarkPublisher,
    ) -> Self {
        let to_partitions = (0..edge_publisher.partitions()).collect();
        SourceForwarder {
            source,
            read_batch_size: settings.read_batch_size,
            idle_detector: settings
                .idle_config
                .clone()
                .map(|config| SourceIdleDetector::new(config, settings.max_delay)),
            fetcher,
            edge_publisher,
            propagator: IdleWatermarkPropagator::new(
                settings.idle_check_threshold,
                &settings.vertex_name,
                &settings.pipeline_name,
            ),
            to_partitions,
            pending_offset: None,
            held_idle_wm: None,
            labels: vertex_labels(&settings.vertex_name, &settings.pipeline_name),
        }
    }

    /// Runs the forwarder until the token is cancelled. Any error stops the forwarder.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.read_batch_size,
            partitions = ?self.to_partitions,
            "Starting source forwarder"
        );

        loop {
            let messages = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancellation token is cancelled, stopping the source forwarder");
                    break;
                }
                messages = self.source.read(self.read_batch_size) => messages?,
            };

            if messages.is_empty() {
                self.handle_idle().await?;
                continue;
            }
            self.forward(messages).await?;
        }

        Ok(())
    }

    /// Hands the source back, used to stop it after the forwarder is done.
    pub fn into_source(self) -> S {
        self.source
    }

    async fn forward(&mut self, messages: Vec<ReadMessage>) -> Result<()> {
        if let Some(detector) = &mut self.idle_detector {
            detector.reset();
        }
        self.held_idle_wm = None;
        self.source.publish_source_watermarks(&messages).await?;

        self.pending_offset = messages.last().map(|m| m.offset.offset);
        self.publish_pending_watermark().await?;

        let offsets: Vec<Offset> = messages.iter().map(|m| m.offset).collect();
        let count = offsets.len() as u64;
        self.source.ack(offsets).await?;
        watermark_metrics()
            .forwarder_ack
            .get_or_create(&self.labels)
            .inc_by(count);
        debug!(count, "Forwarded batch");
        Ok(())
    }

    /// Publishes the source watermark to every downstream partition at the offset of the last
    /// forwarded batch, once the fetcher knows a watermark.
    async fn publish_pending_watermark(&mut self) -> Result<()> {
        let Some(offset) = self.pending_offset else {
            return Ok(());
        };

        let watermark = self
            .fetcher
            .fetch_head_watermark(self.source.partition_idx());
        if watermark == -1 {
            debug!(offset, "Source watermark not visible yet, edge watermark stays pending");
            return Ok(());
        }

        for partition in &self.to_partitions {
            self.edge_publisher
                .publish_watermark(watermark, Some(offset), *partition)
                .await?;
        }
        self.pending_offset = None;
        Ok(())
    }

    async fn handle_idle(&mut self) -> Result<()> {
        let partition = self.source.partition_idx();
        self.publish_pending_watermark().await?;
        self.release_held_idle_wm(partition);

        if self.held_idle_wm.is_none()
            && let Some(detector) = &mut self.idle_detector
            && detector.is_source_idling()
        {
            let computed = self.fetcher.fetch_head_watermark(partition);
            let idle_wm = detector.update_and_fetch_idle_wm(computed);
            if idle_wm != -1
                && let Some(watermark) = DateTime::from_timestamp_millis(idle_wm)
            {
                self.source.publish_idle_watermarks(watermark).await?;
                self.held_idle_wm = Some(idle_wm);
            }
        }

        let propagated = self
            .propagator
            .propagate(
                &self.fetcher,
                partition,
                &mut self.edge_publisher,
                &self.to_partitions,
            )
            .await?;
        if propagated {
            self.held_idle_wm = None;
        }
        Ok(())
    }

    /// An idle watermark can never converge while another processor of the source is active.
    /// Once the fetcher has caught up with the held watermark and still sees an active
    /// processor, the hold is released so this processor does not cap the source watermark.
    fn release_held_idle_wm(&mut self, partition: u16) {
        let Some(held) = self.held_idle_wm else {
            return;
        };
        if self.fetcher.fetch_head_idle_wmb(partition).is_none()
            && self.fetcher.fetch_head_watermark(partition) >= held
        {
            debug!(held, "Another processor is active, releasing the held idle watermark");
            self.held_idle_wm = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::IdleConfig;
    use crate::store::WatermarkStore;
    use crate::store::memory::InMemoryStore;
    use crate::wmb::{WMB, Watermark};

    /// Source that hands out the given batches and then nothing.
    struct BatchSource {
        batches: VecDeque<Vec<ReadMessage>>,
        publisher: WatermarkPublisher,
        acked: Arc<Mutex<Vec<Offset>>>,
    }

    impl BatchSource {
        fn new(store: &InMemoryStore, batches: Vec<Vec<ReadMessage>>) -> Self {
            BatchSource {
                batches: batches.into(),
                publisher: WatermarkPublisher::source(
                    "in-0",
                    Arc::new(store.clone()),
                    Duration::ZERO,
                ),
                acked: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Source for BatchSource {
        async fn read(&mut self, _count: usize) -> Result<Vec<ReadMessage>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.batches.pop_front().unwrap_or_default())
        }

        async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()> {
            self.acked.lock().extend(offsets);
            Ok(())
        }

        fn is_empty(&self) -> bool {
            self.batches.is_empty()
        }

        fn partition_idx(&self) -> u16 {
            0
        }

        async fn publish_source_watermarks(&mut self, messages: &[ReadMessage]) -> Result<()> {
            let first = &messages[0];
            self.publisher
                .publish_watermark(
                    first.event_time.timestamp_millis(),
                    Some(first.offset.offset),
                    0,
                )
                .await
        }

        async fn publish_idle_watermarks(&mut self, watermark: Watermark) -> Result<()> {
            self.publisher
                .publish_idle_watermark(watermark.timestamp_millis(), None, 0)
                .await
        }
    }

    fn batch(first_offset: i64, event_time_ms: i64, count: i64) -> Vec<ReadMessage> {
        (first_offset..first_offset + count)
            .map(|offset| {
                let offset = Offset {
                    offset,
                    partition_idx: 0,
                };
                ReadMessage {
                    id: offset.to_string(),
                    keys: Arc::from(vec!["key-0-0".to_string()]),
                    payload: Bytes::from_static(b"payload"),
                    event_time: DateTime::from_timestamp_millis(event_time_ms).unwrap(),
                    offset,
                }
            })
            .collect()
    }

    async fn edge_wmb(store: &InMemoryStore, partition: u16) -> Option<WMB> {
        store
            .get(&format!("in-0/{partition}"))
            .await
            .unwrap()
            .map(|bytes| WMB::try_from(bytes).unwrap())
    }

    async fn eventually_wmb(
        store: &InMemoryStore,
        partition: u16,
        condition: impl Fn(&WMB) -> bool,
    ) -> WMB {
        for _ in 0..200 {
            if let Some(wmb) = edge_wmb(store, partition).await
                && condition(&wmb)
            {
                return wmb;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("edge watermark not published in time");
    }

    async fn forwarder(
        source_store: &InMemoryStore,
        edge_store: &InMemoryStore,
        batches: Vec<Vec<ReadMessage>>,
        idle_config: Option<IdleConfig>,
    ) -> SourceForwarder<BatchSource> {
        let settings = Settings {
            partitions: 2,
            read_batch_size: 10,
            idle_config,
            ..Settings::default()
        };
        let fetcher = WatermarkFetcher::new(Arc::new(source_store.clone()))
            .await
            .unwrap();
        let edge_publisher =
            WatermarkPublisher::new("in-0", Arc::new(edge_store.clone()), settings.partitions);
        SourceForwarder::new(
            BatchSource::new(source_store, batches),
            &settings,
            fetcher,
            edge_publisher,
        )
    }

    #[tokio::test]
    async fn test_forward_watermarks() {
        let source_store = InMemoryStore::new("source-ot");
        let edge_store = InMemoryStore::new("edge-ot");
        let mut forwarder = forwarder(
            &source_store,
            &edge_store,
            vec![batch(1, 1000, 3), batch(4, 2000, 3), batch(7, 3000, 3)],
            None,
        )
        .await;
        let acked = Arc::clone(&forwarder.source.acked);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                forwarder.start(cancel).await.unwrap();
                forwarder
            }
        });

        // both partitions of the edge get the source watermark at the offset of the last message
        for partition in 0..2 {
            let wmb = eventually_wmb(&edge_store, partition, |wmb| wmb.offset == 9).await;
            assert!(!wmb.idle);
            assert!(wmb.watermark >= 1000 && wmb.watermark <= 3000);
        }

        cancel.cancel();
        let forwarder = handle.await.unwrap();
        assert_eq!(acked.lock().len(), 9);
        // no idle config, nothing idle is ever published
        assert!(!edge_wmb(&edge_store, 0).await.unwrap().idle);
        assert!(forwarder.into_source().is_empty());
    }

    #[tokio::test]
    async fn test_idle_watermark_is_propagated() {
        let source_store = InMemoryStore::new("source-ot");
        let edge_store = InMemoryStore::new("edge-ot");
        let mut forwarder = forwarder(
            &source_store,
            &edge_store,
            vec![batch(1, 1000, 2), batch(3, 2000, 2)],
            Some(IdleConfig::default()),
        )
        .await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { forwarder.start(cancel).await }
        });

        // the source idles at its head watermark and the edge follows once it converged
        for partition in 0..2 {
            let wmb = eventually_wmb(&edge_store, partition, |wmb| wmb.idle).await;
            assert_eq!(wmb.watermark, 2000);
            assert!(wmb.watermark <= Utc::now().timestamp_millis());
        }

        let source_head = WMB::try_from(source_store.get("in-0/0").await.unwrap().unwrap()).unwrap();
        assert!(source_head.idle);
        assert_eq!(source_head.watermark, 2000);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_incrementing_idle_watermark_is_propagated() {
        let source_store = InMemoryStore::new("source-ot");
        let edge_store = InMemoryStore::new("edge-ot");
        let mut forwarder = forwarder(
            &source_store,
            &edge_store,
            vec![batch(1, 1000, 2), batch(3, 2000, 2)],
            Some(IdleConfig {
                threshold: Duration::ZERO,
                step_interval: Duration::ZERO,
                increment_by: Duration::from_millis(100),
            }),
        )
        .await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { forwarder.start(cancel).await }
        });

        // every step moves the source idle watermark by 100, each one is held until propagated
        for partition in 0..2 {
            let wmb = eventually_wmb(&edge_store, partition, |wmb| {
                wmb.idle && wmb.watermark > 2000
            })
            .await;
            assert_eq!((wmb.watermark - 2000) % 100, 0);
            assert_eq!(wmb.offset, 4);
        }

        // and it keeps moving
        eventually_wmb(&edge_store, 0, |wmb| wmb.idle && wmb.watermark >= 2300).await;

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_single_batch_reaches_edge() {
        let source_store = InMemoryStore::new("source-ot");
        let edge_store = InMemoryStore::new("edge-ot");
        let mut forwarder =
            forwarder(&source_store, &edge_store, vec![batch(1, 1000, 3)], None).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { forwarder.start(cancel).await }
        });

        for partition in 0..2 {
            let wmb = eventually_wmb(&edge_store, partition, |wmb| wmb.offset == 3).await;
            assert!(!wmb.idle);
            assert_eq!(wmb.watermark, 1000);
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_held_idle_watermark_released_when_other_processor_active() {
        let source_store = InMemoryStore::new("source-ot");
        let edge_store = InMemoryStore::new("edge-ot");
        let mut forwarder = forwarder(
            &source_store,
            &edge_store,
            vec![batch(1, 1000, 1)],
            Some(IdleConfig {
                threshold: Duration::ZERO,
                step_interval: Duration::ZERO,
                increment_by: Duration::from_millis(100),
            }),
        )
        .await;

        // another replica of the source keeps reading data, far ahead of this one
        source_store
            .put(
                "in-1/0",
                WMB {
                    idle: false,
                    offset: 50,
                    watermark: 100_000,
                }
                .encode(),
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { forwarder.start(cancel).await }
        });

        // nothing converges, yet this replica keeps stepping its idle watermark
        let mut source_head = None;
        for _ in 0..200 {
            let wmb =
                WMB::try_from(source_store.get("in-0/0").await.unwrap().unwrap()).unwrap();
            if wmb.idle && wmb.watermark >= 1300 {
                source_head = Some(wmb);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source_head.is_some());
        assert!(!edge_wmb(&edge_store, 0).await.unwrap().idle);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
