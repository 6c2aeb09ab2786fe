use std::sync::Arc;
use serde::Serialize;
use time::OffsetDateTime;
use crate::domain::{HealthReport, PersistenceError, RecordQuery, RecordedDevice, SensorRecord, StoreStats};
use crate::service::persistence::PersistenceGateway;
use crate::state::{ConnectionTracker, MetricsRegistry};

/// One row of the `/devices` view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub last_seen_timestamp: i64,
    pub stress_index: Option<f64>,
    pub message_count: u64,
}

/// Read-only view over the state the pipeline and the tracker write.
#[derive(Clone)]
pub struct StatusSurface {
    connection: Arc<ConnectionTracker>,
    gateway: Arc<PersistenceGateway>,
    registry: Arc<MetricsRegistry>,
}

impl StatusSurface {
    pub fn new(
        connection: Arc<ConnectionTracker>,
        gateway: Arc<PersistenceGateway>,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self { connection, gateway, registry }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            mqtt_connected: self.connection.is_connected(),
            database_available: self.gateway.is_available(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn metrics(&self) -> String {
        self.registry.render()
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.registry
            .devices()
            .into_iter()
            .map(|(device_id, snapshot)| DeviceStatus {
                message_count: self.registry.device_message_count(&device_id),
                device_id,
                temperature: snapshot.temperature,
                humidity: snapshot.humidity,
                last_seen_timestamp: snapshot.last_seen_timestamp,
                stress_index: snapshot.stress_index,
            })
            .collect()
    }

    /// Devices with persisted records, as opposed to those seen since start.
    pub async fn recorded_devices(&self) -> Result<Vec<RecordedDevice>, PersistenceError> {
        let devices = self.gateway.recorded_devices().await?;
        Ok(devices.into_iter().map(|device_id| RecordedDevice { device_id }).collect())
    }

    pub async fn device_history(
        &self,
        device_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<SensorRecord>, PersistenceError> {
        self.gateway.device_records(device_id, query).await
    }

    pub async fn stored_stats(&self) -> Result<StoreStats, PersistenceError> {
        self.gateway.stats().await
    }
}
