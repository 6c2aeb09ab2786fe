pub mod deriver;
pub mod persistence;
pub mod processor;
pub mod status;
pub mod worker;

pub use deriver::{stress_index, MetricDeriver};
pub use persistence::PersistenceGateway;
pub use processor::{IngestOutcome, IngestionPipeline};
pub use status::{DeviceStatus, StatusSurface};
pub use worker::IngestWorker;
