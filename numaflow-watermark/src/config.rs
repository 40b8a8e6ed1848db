//! Settings are passed to the process as a base64 encoded JSON object in the
//! `NUMAFLOW_WATERMARK_OBJECT` environment variable. When the variable is absent the defaults
//! are used.
//!
//! ```json
//! {
//!   "vertex": "in",
//!   "pipeline": "simple-pipeline",
//!   "partitions": 1,
//!   "idleCheckThreshold": 2,
//!   "idle": { "thresholdMs": 5000, "stepIntervalMs": 1000, "incrementByMs": 100 },
//!   "generator": { "rpu": 5, "durationMs": 1000, "keyCount": 1 }
//! }
//! ```

use std::env;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::error::{Error, Result};

pub(crate) const ENV_WATERMARK_OBJ: &str = "NUMAFLOW_WATERMARK_OBJECT";

const DEFAULT_VERTEX_NAME: &str = "in";
const DEFAULT_PIPELINE_NAME: &str = "simple-pipeline";
const DEFAULT_PARTITIONS: u16 = 1;
const DEFAULT_READ_BATCH_SIZE: usize = 500;
const DEFAULT_IDLE_CHECK_THRESHOLD: usize = 2;
/// the first idle observation only opens a streak, fewer matches can never converge
const MIN_IDLE_CHECK_THRESHOLD: usize = 2;
const DEFAULT_RPU: usize = 5;
const DEFAULT_GENERATOR_DURATION_MILLIS: u64 = 1000;
const DEFAULT_KEY_COUNT: u32 = 1;
const DEFAULT_MSG_SIZE_BYTES: u32 = 8;
const DEFAULT_READ_TIMEOUT_MILLIS: u64 = 3000;

/// Settings of a watermark-publishing vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub vertex_name: String,
    pub pipeline_name: String,
    pub replica: u16,
    /// Partitions of the downstream buffer.
    pub partitions: u16,
    pub read_batch_size: usize,
    /// Subtracted from source watermarks to tolerate late data.
    pub max_delay: Duration,
    /// Consecutive identical idle observations required before propagating an idle watermark.
    pub idle_check_threshold: usize,
    pub idle_config: Option<IdleConfig>,
    pub generator_config: GeneratorConfig,
}

/// Idle configuration for detecting idleness when there is no data from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleConfig {
    /// How long the source has to be silent before it is considered idling.
    pub threshold: Duration,
    /// Minimum gap between two idle watermark publishes.
    pub step_interval: Duration,
    /// Added to the current watermark for every idle publish.
    pub increment_by: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        IdleConfig {
            threshold: Duration::from_millis(0),
            step_interval: Duration::from_millis(0),
            increment_by: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorConfig {
    /// Records generated per key every `duration`.
    pub rpu: usize,
    pub duration: Duration,
    pub key_count: u32,
    pub msg_size_bytes: u32,
    /// Fixed value to put in the payload, defaults to the creation timestamp.
    pub value: Option<u64>,
    pub read_timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            rpu: DEFAULT_RPU,
            duration: Duration::from_millis(DEFAULT_GENERATOR_DURATION_MILLIS),
            key_count: DEFAULT_KEY_COUNT,
            msg_size_bytes: DEFAULT_MSG_SIZE_BYTES,
            value: None,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MILLIS),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            vertex_name: DEFAULT_VERTEX_NAME.to_string(),
            pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
            replica: 0,
            partitions: DEFAULT_PARTITIONS,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            max_delay: Duration::from_millis(0),
            idle_check_threshold: DEFAULT_IDLE_CHECK_THRESHOLD,
            idle_config: None,
            generator_config: GeneratorConfig::default(),
        }
    }
}

impl Settings {
    /// Loads the settings from the environment, falling back to defaults.
    pub fn load() -> Result<Self> {
        match env::var(ENV_WATERMARK_OBJ) {
            Ok(obj) => Self::from_encoded(&obj),
            Err(env::VarError::NotPresent) => Ok(Settings::default()),
            Err(e) => Err(Error::Config(format!(
                "Failed to read {ENV_WATERMARK_OBJ}: {e}"
            ))),
        }
    }

    /// Parses the base64 encoded JSON spec.
    pub fn from_encoded(obj: &str) -> Result<Self> {
        let decoded = BASE64_STANDARD
            .decode(obj.as_bytes())
            .map_err(|e| Error::Config(format!("Failed to base64 decode watermark spec: {e:?}")))?;

        let spec: WatermarkSpec = serde_json::from_slice(&decoded)
            .map_err(|e| Error::Config(format!("Failed to parse watermark spec: {e:?}")))?;

        spec.try_into()
    }
}

/// JSON shape of the spec, converted into [Settings] after validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatermarkSpec {
    vertex: Option<String>,
    pipeline: Option<String>,
    replica: Option<u16>,
    partitions: Option<u16>,
    read_batch_size: Option<usize>,
    max_delay_ms: Option<u64>,
    idle_check_threshold: Option<usize>,
    idle: Option<IdleSpec>,
    generator: Option<GeneratorSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdleSpec {
    threshold_ms: Option<u64>,
    step_interval_ms: Option<u64>,
    increment_by_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratorSpec {
    rpu: Option<usize>,
    duration_ms: Option<u64>,
    key_count: Option<u32>,
    msg_size_bytes: Option<u32>,
    value: Option<u64>,
    read_timeout_ms: Option<u64>,
}

impl From<IdleSpec> for IdleConfig {
    fn from(spec: IdleSpec) -> Self {
        let ms = |v: Option<u64>| Duration::from_millis(v.unwrap_or(0));
        IdleConfig {
            threshold: ms(spec.threshold_ms),
            step_interval: ms(spec.step_interval_ms),
            increment_by: ms(spec.increment_by_ms),
        }
    }
}

impl TryFrom<GeneratorSpec> for GeneratorConfig {
    type Error = Error;

    fn try_from(spec: GeneratorSpec) -> Result<Self> {
        let defaults = GeneratorConfig::default();
        let config = GeneratorConfig {
            rpu: spec.rpu.unwrap_or(defaults.rpu),
            duration: spec
                .duration_ms
                .map_or(defaults.duration, Duration::from_millis),
            key_count: spec.key_count.unwrap_or(defaults.key_count),
            msg_size_bytes: spec.msg_size_bytes.unwrap_or(defaults.msg_size_bytes),
            value: spec.value,
            read_timeout: spec
                .read_timeout_ms
                .map_or(defaults.read_timeout, Duration::from_millis),
        };

        if config.rpu == 0 || config.key_count == 0 {
            return Err(Error::Config(
                "generator rpu and keyCount must be greater than 0".to_string(),
            ));
        }
        if config.duration.is_zero() {
            return Err(Error::Config(
                "generator duration must be greater than 0".to_string(),
            ));
        }
        Ok(config)
    }
}

impl TryFrom<WatermarkSpec> for Settings {
    type Error = Error;

    fn try_from(spec: WatermarkSpec) -> Result<Self> {
        let defaults = Settings::default();

        let partitions = spec.partitions.unwrap_or(defaults.partitions);
        if partitions == 0 {
            return Err(Error::Config("partitions must be greater than 0".to_string()));
        }

        let read_batch_size = spec.read_batch_size.unwrap_or(defaults.read_batch_size);
        if read_batch_size == 0 {
            return Err(Error::Config(
                "readBatchSize must be greater than 0".to_string(),
            ));
        }

        let idle_check_threshold = spec
            .idle_check_threshold
            .unwrap_or(defaults.idle_check_threshold);
        if idle_check_threshold < MIN_IDLE_CHECK_THRESHOLD {
            return Err(Error::Config(format!(
                "idleCheckThreshold must be at least {MIN_IDLE_CHECK_THRESHOLD}, got {idle_check_threshold}"
            )));
        }

        let generator_config = match spec.generator {
            Some(generator) => generator.try_into()?,
            None => defaults.generator_config,
        };

        Ok(Settings {
            vertex_name: spec.vertex.unwrap_or(defaults.vertex_name),
            pipeline_name: spec.pipeline.unwrap_or(defaults.pipeline_name),
            replica: spec.replica.unwrap_or(defaults.replica),
            partitions,
            read_batch_size,
            max_delay: spec
                .max_delay_ms
                .map_or(defaults.max_delay, Duration::from_millis),
            idle_check_threshold,
            idle_config: spec.idle.map(IdleConfig::from),
            generator_config,
        })
    }
}
