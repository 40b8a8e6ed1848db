//! WMB (Watermark Marker) is the record a processor writes to the offset-timeline store for every
//! partition it publishes to. The record is persisted as an opaque blob and read by processes
//! that know nothing about the writer, so the layout is fixed:
//!
//! ```text
//! +---------+----------------------+-------------------------+
//! | idle:u8 | offset:i64 (LE)      | watermark:i64 (LE)      |
//! +---------+----------------------+-------------------------+
//!  byte 0    bytes 1..9             bytes 9..17
//! ```
//!
//! Decoding only looks at the first [WMB_ENCODED_LEN] bytes. Anything after that is ignored so
//! the record can grow new trailing fields without breaking older readers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Convergence checker for head idle WMBs.
pub(crate) mod checker;

pub use checker::WMBChecker;

/// Size of an encoded [WMB] in bytes.
pub const WMB_ENCODED_LEN: usize = 17;

/// Watermark is a monotonically increasing time.
pub type Watermark = DateTime<Utc>;

/// WMB is the watermark marker published by a processor for a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub struct WMB {
    /// true if the partition produced no new data since the previous report.
    pub idle: bool,
    /// Position within the partition, only meaningful for ordering and equality.
    pub offset: i64,
    /// Epoch milliseconds.
    pub watermark: i64,
}

impl WMB {
    /// Encodes the WMB into its fixed 17-byte wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(WMB_ENCODED_LEN);
        buf.put_u8(u8::from(self.idle));
        buf.put_i64_le(self.offset);
        buf.put_i64_le(self.watermark);
        buf.freeze()
    }

    /// Decodes a WMB from the first 17 bytes of `buf`. Trailing bytes are ignored, a shorter
    /// buffer is an [Error::Encoding].
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < WMB_ENCODED_LEN {
            return Err(Error::Encoding(format!(
                "WMB needs {WMB_ENCODED_LEN} bytes, got {}",
                buf.len()
            )));
        }

        // any nonzero byte is true
        let idle = buf.get_u8() != 0;
        let offset = buf.get_i64_le();
        let watermark = buf.get_i64_le();

        Ok(WMB {
            idle,
            offset,
            watermark,
        })
    }
}

impl TryFrom<&[u8]> for WMB {
    type Error = Error;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        WMB::decode(value)
    }
}

impl TryFrom<Bytes> for WMB {
    type Error = Error;

    fn try_from(bytes: Bytes) -> std::result::Result<Self, Self::Error> {
        WMB::decode(&bytes)
    }
}

impl From<WMB> for Bytes {
    fn from(wmb: WMB) -> Self {
        wmb.encode()
    }
}
