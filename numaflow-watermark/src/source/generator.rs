//! Generator fires once every `duration` and generates `rpu` records for each of the `key_count`
//! keys. The records are JSON payloads carrying their creation time, which becomes the event time.
//!
//! There is exactly one worker generating records no matter how far behind it is. The ticker keeps
//! firing and its ticks are buffered for the worker, they are not dropped. The records go through
//! a bounded channel so a slow reader applies backpressure on the worker instead of growing a
//! backlog.

use std::sync::Arc;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{GeneratorConfig, Settings};
use crate::error::{Error, Result};
use crate::message::{Offset, ReadMessage};
use crate::metrics::{Labels, vertex_labels, watermark_metrics};
use crate::publisher::WatermarkPublisher;
use crate::source::Source;
use crate::store::WatermarkStore;
use crate::wmb::Watermark;

/// rate is capped to 10000 records per key per duration.
const MAX_RATE: usize = 10000;
/// ticks buffered while the worker is busy.
const TICK_BUFFER_SIZE: usize = 1000;
/// records buffered per (rpu x key) unit.
const RECORD_BUFFER_FACTOR: usize = 5;
/// bytes taken by the value field in the payload.
const VALUE_SIZE_BYTES: u32 = 8;

#[derive(Debug, Serialize, Deserialize)]
struct Data {
    #[serde(default, skip_serializing_if = "is_zero")]
    value: u64,
    /// only to ensure a desired message size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    padding: Option<String>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Payload {
    data: Data,
    /// creation time in nanos
    createdts: i64,
}

/// Generated record waiting to be read.
#[derive(Debug)]
struct Record {
    key: String,
    payload: Bytes,
    offset: i64,
}

/// Everything the worker needs to build records.
#[derive(Debug, Clone)]
struct RecordGenerator {
    rate: usize,
    key_count: u32,
    replica: u16,
    value: Option<u64>,
    /// random bytes added to every payload to reach the configured message size
    padding_size: usize,
}

impl RecordGenerator {
    fn new(config: &GeneratorConfig, replica: u16) -> Self {
        let rate = if config.rpu > MAX_RATE {
            info!(
                rpu = config.rpu,
                "Capping the rate to {MAX_RATE} msg per duration"
            );
            MAX_RATE
        } else {
            config.rpu
        };

        RecordGenerator {
            rate,
            key_count: config.key_count,
            replica,
            value: config.value,
            padding_size: config.msg_size_bytes.saturating_sub(VALUE_SIZE_BYTES) as usize,
        }
    }

    /// Records buffered between the worker and the reader.
    fn buffer_capacity(&self) -> usize {
        self.rate
            .saturating_mul(self.key_count as usize)
            .saturating_mul(RECORD_BUFFER_FACTOR)
            .clamp(1, Semaphore::MAX_PERMITS)
    }

    fn payload(&self, created_ts: i64) -> Bytes {
        let padding = (self.padding_size > 0).then(|| {
            let mut padding = vec![0u8; self.padding_size];
            rand::thread_rng().fill(padding.as_mut_slice());
            BASE64_STANDARD.encode(padding)
        });

        let payload = Payload {
            data: Data {
                value: self.value.unwrap_or(created_ts as u64),
                padding,
            },
            createdts: created_ts,
        };
        match serde_json::to_vec(&payload) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(error = ?e, "Failed to serialize the payload");
                Bytes::new()
            }
        }
    }
}

/// Extracts the creation time (nanos) from the payload, 0 if it cannot be parsed.
fn parse_time(payload: &[u8]) -> i64 {
    match serde_json::from_slice::<Payload>(payload) {
        Ok(payload) => payload.createdts,
        Err(e) => {
            debug!(error = ?e, "Payload is not a generator payload, could not extract time");
            0
        }
    }
}

/// Event time from the nanos, un-parseable or invalid time is substituted with the current time.
fn event_time_from_nanos(nanos: i64) -> DateTime<Utc> {
    if nanos > 0 {
        DateTime::from_timestamp_nanos(nanos)
    } else {
        Utc::now()
    }
}

/// Generator source, publishes its watermarks into the source offset-timeline store.
pub struct Generator {
    vertex_name: String,
    replica: u16,
    read_timeout: std::time::Duration,
    records_rx: mpsc::Receiver<Record>,
    capacity: usize,
    publisher: WatermarkPublisher,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    labels: Labels,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("vertex_name", &self.vertex_name)
            .field("replica", &self.replica)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Generator {
    /// Creates the generator and starts generating. Generation stops when `cancel` is cancelled
    /// or [Generator::stop] is called.
    pub fn new(
        settings: &Settings,
        store: Arc<dyn WatermarkStore>,
        cancel: CancellationToken,
    ) -> Self {
        let config = &settings.generator_config;
        let record_generator = RecordGenerator::new(config, settings.replica);
        let capacity = record_generator.buffer_capacity();
        let (records_tx, records_rx) = mpsc::channel(capacity);
        let labels = vertex_labels(&settings.vertex_name, &settings.pipeline_name);

        // the processing entity of a source is the replica
        let publisher = WatermarkPublisher::source(
            format!("{}-{}", settings.vertex_name, settings.replica),
            store,
            settings.max_delay,
        );

        let cancel = cancel.child_token();
        let handle = tokio::spawn(run_ticker(
            config.duration,
            record_generator,
            records_tx,
            labels.clone(),
            cancel.clone(),
        ));

        Generator {
            vertex_name: settings.vertex_name.clone(),
            replica: settings.replica,
            read_timeout: config.read_timeout,
            records_rx,
            capacity,
            publisher,
            cancel,
            handle: Some(handle),
            labels,
        }
    }

    /// Stops generating, waits for the worker to exit and removes the generator's watermarks
    /// from the store.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::Source(format!("generator task failed: {e:?}")))?;
        }
        self.publisher.close().await
    }

    fn read_message(&self, record: Record) -> ReadMessage {
        let offset = Offset {
            offset: record.offset,
            partition_idx: self.replica,
        };
        ReadMessage {
            id: offset.to_string(),
            keys: Arc::from(vec![record.key]),
            event_time: event_time_from_nanos(parse_time(&record.payload)),
            payload: record.payload,
            offset,
        }
    }
}

impl Source for Generator {
    async fn read(&mut self, count: usize) -> Result<Vec<ReadMessage>> {
        let mut messages = Vec::with_capacity(count.min(self.capacity));
        // the timeout covers the whole read, not each message
        let deadline = tokio::time::Instant::now() + self.read_timeout;

        while messages.len() < count {
            match tokio::time::timeout_at(deadline, self.records_rx.recv()).await {
                Ok(Some(record)) => messages.push(self.read_message(record)),
                Ok(None) => {
                    debug!("Generator stopped, no more records");
                    break;
                }
                Err(_) => {
                    debug!(waited = ?self.read_timeout, read = messages.len(), "Timed out waiting for messages to read");
                    break;
                }
            }
        }

        watermark_metrics()
            .generator_read
            .get_or_create(&self.labels)
            .inc_by(messages.len() as u64);
        Ok(messages)
    }

    async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()> {
        // nothing to ack for generated data
        debug!(count = offsets.len(), "Acked generator offsets");
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.records_rx.is_empty()
    }

    /// Source is like a buffer with only one partition, so it is always 0.
    fn partition_idx(&self) -> u16 {
        0
    }

    async fn publish_source_watermarks(&mut self, messages: &[ReadMessage]) -> Result<()> {
        // the first event time keeps the watermark conservative
        let Some(first) = messages.first() else {
            return Ok(());
        };
        self.publisher
            .publish_watermark(first.event_time.timestamp_millis(), None, 0)
            .await
    }

    async fn publish_idle_watermarks(&mut self, watermark: Watermark) -> Result<()> {
        self.publisher
            .publish_idle_watermark(watermark.timestamp_millis(), None, 0)
            .await?;
        watermark_metrics()
            .idle_wm_published
            .get_or_create(&self.labels)
            .inc();
        Ok(())
    }
}

/// Fires once every duration and hands the tick to the single worker.
async fn run_ticker(
    duration: std::time::Duration,
    record_generator: RecordGenerator,
    records_tx: mpsc::Sender<Record>,
    labels: Labels,
    cancel: CancellationToken,
) {
    let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER_SIZE);
    let worker = tokio::spawn(run_worker(
        record_generator,
        tick_rx,
        records_tx,
        labels,
        cancel.clone(),
    ));

    let mut ticker = tokio::time::interval(duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancellation token is cancelled, exiting generator loop");
                break;
            }
            _ = ticker.tick() => {
                // waits for room in the buffer rather than dropping the tick, the worker exits on
                // cancellation so this never outlives it
                if tick_tx.send(Utc::now()).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(tick_tx);
    if let Err(e) = worker.await {
        error!(error = ?e, "Generator worker failed");
    }
}

/// The one and only worker, turns ticks into records.
async fn run_worker(
    record_generator: RecordGenerator,
    mut tick_rx: mpsc::Receiver<DateTime<Utc>>,
    records_tx: mpsc::Sender<Record>,
    labels: Labels,
    cancel: CancellationToken,
) {
    let mut last_offset = 0i64;

    'ticks: loop {
        let ts = tokio::select! {
            _ = cancel.cancelled() => break,
            ts = tick_rx.recv() => match ts {
                Some(ts) => ts,
                None => break,
            },
        };
        watermark_metrics().generator_tick.get_or_create(&labels).inc();

        // all the replicas generate the same keys in the same order
        let created_ts = ts.timestamp_nanos_opt().unwrap_or_default();
        for _ in 0..record_generator.rate {
            for k in 0..record_generator.key_count {
                // offsets are nanos, forced to be strictly increasing
                let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
                last_offset = now.max(last_offset + 1);

                let record = Record {
                    key: format!("key-{}-{}", record_generator.replica, k),
                    payload: record_generator.payload(created_ts),
                    offset: last_offset,
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cancellation token is cancelled, returning from the worker");
                        break 'ticks;
                    }
                    sent = records_tx.send(record) => {
                        if sent.is_err() {
                            warn!("Generator reader is gone, stopping the worker");
                            break 'ticks;
                        }
                    }
                }
            }
        }
    }

    // empty any pending ticks
    tick_rx.close();
    let mut pending = 0;
    while tick_rx.try_recv().is_ok() {
        pending += 1;
    }
    if pending > 0 {
        info!(pending, "Emptied pending ticks");
    }
}
