//! Idling happens when no messages are read from the source for a while. Downstream event-time
//! computation would stall waiting for data that is not coming, so idle watermarks are
//! published to keep it moving.
//!
//! > Source Idling
//!
//! The source decides on its own when it is idling and publishes idle watermarks into its own
//! offset-timeline store.
//!
//! > Propagation
//!
//! The forwarder only propagates an idle watermark downstream after every processor of the
//! source store agreed on the same idle head for several consecutive polls.

/// Idle detection for Source.
pub(crate) mod source;

/// Convergence based propagation of idle watermarks to the next edge.
pub(crate) mod propagator;

pub use propagator::IdleWatermarkPropagator;
pub use source::SourceIdleDetector;
