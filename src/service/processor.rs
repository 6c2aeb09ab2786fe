use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};
use crate::domain::{DecodedReading, PayloadError, PersistenceError, TelemetryMessage};
use crate::service::deriver::MetricDeriver;
use crate::service::persistence::PersistenceGateway;
use crate::state::{MetricsRegistry, ReceivedCounter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { record_id: i64 },
    /// Metrics were updated but the record was only logged.
    NotPersisted,
}

/// Per-message orchestration: decode, derive metrics, persist, count.
///
/// Messages are handed in one at a time by the ingest worker, so nothing here
/// runs concurrently with itself. The status surface reads the same registry
/// and counter from other tasks.
pub struct IngestionPipeline {
    deriver: MetricDeriver,
    gateway: Arc<PersistenceGateway>,
    registry: Arc<MetricsRegistry>,
    progress: Arc<ReceivedCounter>,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        gateway: Arc<PersistenceGateway>,
        progress: Arc<ReceivedCounter>,
    ) -> Self {
        Self {
            deriver: MetricDeriver::new(registry.clone()),
            gateway,
            registry,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<ReceivedCounter> {
        &self.progress
    }

    /// Process one message and log whatever went wrong. Never fails: a bad
    /// message is dropped and the next one is processed as usual.
    pub async fn handle(&self, message: &TelemetryMessage) -> Option<IngestOutcome> {
        match self.process(message).await {
            Ok(outcome) => Some(outcome),
            Err(e @ PayloadError::MissingDeviceId) => {
                warn!(topic = %message.topic, error = %e, "dropping message without device identifier");
                None
            }
            Err(e) => {
                let raw_payload = String::from_utf8_lossy(&message.raw_payload);
                error!(topic = %message.topic, payload = %raw_payload, error = %e, "dropping malformed payload");
                None
            }
        }
    }

    #[instrument(
        skip(self, message),
        fields(
            topic = %message.topic,
            payload_len = message.raw_payload.len(),
            qos = ?message.qos,
            dup = message.duplicate,
            device_id = tracing::field::Empty,
        )
    )]
    pub async fn process(&self, message: &TelemetryMessage) -> Result<IngestOutcome, PayloadError> {
        // 1. Decode. A malformed payload is not counted as received.
        let reading = DecodedReading::decode(&message.raw_payload).map_err(|e| {
            self.registry.count_payload_error(e.kind());
            e
        })?;

        // 2. Identify. Counted as received, but nothing else happens.
        let Some(device_id) = reading.device_id.clone() else {
            let e = PayloadError::MissingDeviceId;
            self.registry.count_payload_error(e.kind());
            self.progress.increment();
            return Err(e);
        };
        tracing::Span::current().record("device_id", device_id.as_str());

        // 3. Metrics first, so arrival is visible even if storage fails.
        self.deriver.derive(&message.topic, &device_id, &reading);

        // 4. Persist, best effort.
        let outcome = match self
            .gateway
            .write(&device_id, &message.topic, reading.to_json(), OffsetDateTime::now_utc())
            .await
        {
            Ok(record_id) => {
                info!(record_id, "stored data from {}", device_id);
                IngestOutcome::Stored { record_id }
            }
            Err(PersistenceError::Unavailable) => {
                info!(data = %reading.to_json(), "database unavailable, reading logged only");
                IngestOutcome::NotPersisted
            }
            Err(e) => {
                debug!(error = %e, "reading not persisted");
                IngestOutcome::NotPersisted
            }
        };

        // 5. Count, possibly completing the run.
        self.progress.increment();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use crate::service::persistence::tests::MockStore;

    struct Harness {
        pipeline: IngestionPipeline,
        registry: Arc<MetricsRegistry>,
        store: Arc<MockStore>,
    }

    fn harness(target: u64) -> Harness {
        let registry = Arc::new(MetricsRegistry::new());
        let store = Arc::new(MockStore::default());
        let gateway = Arc::new(PersistenceGateway::new(store.clone(), registry.clone(), Duration::from_secs(1)));
        let pipeline = IngestionPipeline::new(registry.clone(), gateway, Arc::new(ReceivedCounter::new(target)));
        Harness { pipeline, registry, store }
    }

    fn message(payload: &str) -> TelemetryMessage {
        TelemetryMessage::new("sensors/d1/data", payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_valid_message_updates_metrics_and_stores() {
        let h = harness(0);
        let outcome = h
            .pipeline
            .process(&message(r#"{"deviceId":"d1","temperature":28,"humidity":100,"battery":3}"#))
            .await
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Stored { record_id: 1 });
        assert_eq!(h.registry.device("d1").unwrap().stress_index, Some(1.0));
        assert_eq!(h.registry.message_count("sensors/d1/data", "d1"), 1);

        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "sensors/d1/data");
        assert_eq!(records[0].data["battery"], 3);
        assert_eq!(h.pipeline.progress().received(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_changes_nothing() {
        let h = harness(0);
        for payload in ["{\"deviceId\":", "not json", "[1,2]", ""] {
            let err = h.pipeline.process(&message(payload)).await.unwrap_err();
            assert!(!matches!(err, PayloadError::MissingDeviceId));
            assert_eq!(h.pipeline.handle(&message(payload)).await, None);
        }

        assert_eq!(h.registry.device_count(), 0);
        assert!(h.store.records().is_empty());
        assert_eq!(h.store.connect_calls(), 0);
        assert_eq!(h.pipeline.progress().received(), 0);
    }

    #[tokio::test]
    async fn test_missing_device_id_is_counted_only() {
        let h = harness(0);
        let err = h
            .pipeline
            .process(&message(r#"{"temperature":30,"humidity":90}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, PayloadError::MissingDeviceId));
        assert_eq!(h.registry.device_count(), 0);
        assert!(h.store.records().is_empty());
        assert_eq!(h.pipeline.progress().received(), 1);
    }

    #[tokio::test]
    async fn test_database_down_keeps_metrics_flowing() {
        let h = harness(0);
        h.store.fail_connect.store(true, Ordering::SeqCst);

        for temperature in [20, 25] {
            let payload = format!(r#"{{"deviceId":"d1","temperature":{temperature},"humidity":60}}"#);
            let outcome = h.pipeline.process(&message(&payload)).await.unwrap();
            assert_eq!(outcome, IngestOutcome::NotPersisted);
        }

        assert_eq!(h.store.connect_calls(), 1);
        assert_eq!(h.registry.device("d1").unwrap().temperature, Some(25.0));
        assert_eq!(h.registry.message_count("sensors/d1/data", "d1"), 2);
        assert_eq!(h.pipeline.progress().received(), 2);
    }

    #[tokio::test]
    async fn test_target_count_fires_completion_once() {
        let h = harness(3);
        let completion = h.pipeline.progress().clone();

        for i in 0..2 {
            h.pipeline.handle(&message(&format!(r#"{{"deviceId":"d{i}"}}"#))).await;
        }
        assert!(!completion.completion().is_fired());

        h.pipeline.handle(&message(r#"{"deviceId":"d2"}"#)).await;
        assert!(completion.completion().is_fired());

        // Late arrivals are still processed; the latch stays fired.
        h.pipeline.handle(&message(r#"{"deviceId":"d3"}"#)).await;
        h.pipeline.handle(&message(r#"{"deviceId":"d4"}"#)).await;
        assert_eq!(completion.received(), 5);
        assert!(!completion.completion().fire());
        tokio::time::timeout(Duration::from_secs(1), completion.completion().wait())
            .await
            .unwrap();
    }
}
