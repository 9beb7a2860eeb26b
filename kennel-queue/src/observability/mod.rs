//! Observer hooks, counters, event streams and subscriber setup.
//!
//! Nothing here is required for correctness; the queue reports through a
//! [`QueueObserver`] that defaults to doing nothing.

pub mod events;
pub mod hooks;
pub mod metrics;
pub mod tracing;

pub use events::EventRecorder;
pub use hooks::{CompositeObserver, DeliveryOutcome, NoopObserver, QueueObserver, SharedObserver};
pub use metrics::{JobNameMetrics, LiveMetrics, MetricsSnapshot};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::init_tracing;
