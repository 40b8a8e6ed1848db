//! Prometheus metrics for the watermark components. All the metrics live in one process-wide
//! registry and are labeled with the vertex and pipeline they belong to.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};

const REGISTRY_GLOBAL_PREFIX: &str = "numaflow";

const VERTEX_LABEL: &str = "vertex";
const PIPELINE_LABEL: &str = "pipeline";

// counters, the client library appends the _total suffix
const GENERATOR_TICK_TOTAL: &str = "generator_tick";
const GENERATOR_READ_TOTAL: &str = "generator_read";
const FORWARDER_ACK_TOTAL: &str = "forwarder_ack";
const IDLE_WATERMARK_PUBLISHED_TOTAL: &str = "idle_watermark_published";
const IDLE_WATERMARK_PROPAGATED_TOTAL: &str = "idle_watermark_propagated";
const CORRUPT_WMB_TOTAL: &str = "corrupt_wmb";

pub(crate) type Labels = Vec<(String, String)>;

pub(crate) struct WatermarkMetrics {
    pub(crate) generator_tick: Family<Labels, Counter>,
    pub(crate) generator_read: Family<Labels, Counter>,
    pub(crate) forwarder_ack: Family<Labels, Counter>,
    pub(crate) idle_wm_published: Family<Labels, Counter>,
    pub(crate) idle_wm_propagated: Family<Labels, Counter>,
    /// labeled by the store instead of the vertex
    pub(crate) corrupt_wmb: Family<Labels, Counter>,
}

impl WatermarkMetrics {
    fn new() -> Self {
        WatermarkMetrics {
            generator_tick: Family::default(),
            generator_read: Family::default(),
            forwarder_ack: Family::default(),
            idle_wm_published: Family::default(),
            idle_wm_propagated: Family::default(),
            corrupt_wmb: Family::default(),
        }
    }

    fn register(&self, registry: &mut Registry) {
        registry.register(
            GENERATOR_TICK_TOTAL,
            "Total number of ticks handled by the generator worker",
            self.generator_tick.clone(),
        );
        registry.register(
            GENERATOR_READ_TOTAL,
            "Total number of messages read from the generator",
            self.generator_read.clone(),
        );
        registry.register(
            FORWARDER_ACK_TOTAL,
            "Total number of offsets acked by the source forwarder",
            self.forwarder_ack.clone(),
        );
        registry.register(
            IDLE_WATERMARK_PUBLISHED_TOTAL,
            "Total number of idle watermarks published by the source",
            self.idle_wm_published.clone(),
        );
        registry.register(
            IDLE_WATERMARK_PROPAGATED_TOTAL,
            "Total number of idle watermarks propagated downstream after convergence",
            self.idle_wm_propagated.clone(),
        );
        registry.register(
            CORRUPT_WMB_TOTAL,
            "Total number of WMBs that could not be decoded",
            self.corrupt_wmb.clone(),
        );
    }
}

struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

fn global_registry() -> &'static GlobalRegistry {
    static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_GLOBAL_PREFIX)),
    })
}

/// Metrics of the watermark components, registered on first use.
pub(crate) fn watermark_metrics() -> &'static WatermarkMetrics {
    static WATERMARK_METRICS: OnceLock<WatermarkMetrics> = OnceLock::new();
    WATERMARK_METRICS.get_or_init(|| {
        let metrics = WatermarkMetrics::new();
        metrics.register(&mut global_registry().registry.lock());
        metrics
    })
}

pub(crate) fn vertex_labels(vertex: &str, pipeline: &str) -> Labels {
    vec![
        (VERTEX_LABEL.to_string(), vertex.to_string()),
        (PIPELINE_LABEL.to_string(), pipeline.to_string()),
    ]
}

pub(crate) fn store_labels(store: &str) -> Labels {
    vec![("store".to_string(), store.to_string())]
}

/// Renders all the registered metrics in the OpenMetrics text format.
pub fn metrics_text() -> Result<String> {
    // make sure the families are registered even if nothing was recorded yet
    watermark_metrics();

    let mut buffer = String::new();
    encode(&mut buffer, &global_registry().registry.lock())
        .map_err(|e| Error::Watermark(format!("Failed to encode metrics: {e:?}")))?;
    Ok(buffer)
}
