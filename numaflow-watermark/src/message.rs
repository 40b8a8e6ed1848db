use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Position of a message within a partition of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Offset {
    pub offset: i64,
    pub partition_idx: u16,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.offset, self.partition_idx)
    }
}

/// Message read from a source.
#[derive(Debug, Clone)]
pub struct ReadMessage {
    /// unique id of the message, derived from the offset.
    pub id: String,
    pub keys: Arc<[String]>,
    pub payload: Bytes,
    pub event_time: DateTime<Utc>,
    pub offset: Offset,
}
