use async_trait::async_trait;
use crate::domain::{NewSensorRecord, RecordQuery, SensorRecord, StoreStats};

#[async_trait]
pub trait SensorStore: Send + Sync {
    /// Open (or reopen) the connection to the backing store.
    async fn connect(&self) -> anyhow::Result<()>;

    /// False before the first `connect` and after the backend closed the handle.
    fn is_connected(&self) -> bool;

    /// Create the `sensor_data` table and its indexes if absent. Idempotent.
    async fn ensure_schema(&self) -> anyhow::Result<()>;

    /// Insert one record and return the id the backend assigned to it.
    async fn insert(&self, record: &NewSensorRecord) -> anyhow::Result<i64>;

    /// Distinct device ids that have stored records, sorted.
    async fn recorded_devices(&self) -> anyhow::Result<Vec<String>>;

    /// One device's records inside the query window, newest first.
    async fn device_records(&self, device_id: &str, query: &RecordQuery) -> anyhow::Result<Vec<SensorRecord>>;

    async fn stats(&self) -> anyhow::Result<StoreStats>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Request a QoS 1 subscription. Completion arrives later as a SubAck.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;
}
