use crate::error::Result;
use crate::message::{Offset, ReadMessage};
use crate::wmb::Watermark;

/// [Generator] is a builtin to generate data for load testing and other internal use-cases.
///
/// [Generator]: https://numaflow.numaproj.io/user-guide/sources/generator/
pub mod generator;

/// Set of operations a source has to implement to be driven by the
/// [SourceForwarder](crate::forwarder::SourceForwarder). The watermark side is reached only
/// through the two publish hooks, called whenever the source moves between producing and idling.
#[trait_variant::make(Source: Send)]
pub trait LocalSource {
    /// Reads up to `count` messages. Implementations must bound the wait and return whatever
    /// was read when the wait is over.
    async fn read(&mut self, count: usize) -> Result<Vec<ReadMessage>>;

    /// Acknowledges the offsets.
    async fn ack(&mut self, offsets: Vec<Offset>) -> Result<()>;

    /// true if there is nothing buffered to be read.
    fn is_empty(&self) -> bool;

    /// Partition of the source this instance reads from.
    fn partition_idx(&self) -> u16;

    /// Publishes the watermark for a batch that was just read.
    async fn publish_source_watermarks(&mut self, messages: &[ReadMessage]) -> Result<()>;

    /// Publishes an idle watermark, called when the source has nothing to read.
    async fn publish_idle_watermarks(&mut self, watermark: Watermark) -> Result<()>;
}
