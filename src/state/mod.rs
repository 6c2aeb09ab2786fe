pub mod connection;
pub mod metrics_registry;
pub mod progress;

pub use connection::ConnectionTracker;
pub use metrics_registry::MetricsRegistry;
pub use progress::{CompletionLatch, ReceivedCounter};
