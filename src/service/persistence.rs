use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use crate::domain::{NewSensorRecord, PersistenceError, RecordQuery, SensorRecord, StoreStats};
use crate::ports::SensorStore;
use crate::state::MetricsRegistry;

#[derive(Debug, Default)]
struct InitState {
    schema_ready: bool,
    unavailable_since: Option<Instant>,
}

/// Best-effort writer in front of a `SensorStore`.
///
/// The store is connected lazily on first write. Any failure while connecting
/// or creating the schema latches the gateway unavailable; from then on writes
/// are refused without touching the store. Only when a recovery interval is
/// configured does a later write probe the store again. A failed insert is
/// logged and reported to the caller but leaves availability alone.
pub struct PersistenceGateway {
    store: Option<Arc<dyn SensorStore>>,
    registry: Arc<MetricsRegistry>,
    available: AtomicBool,
    init: Mutex<InitState>,
    write_timeout: Duration,
    recovery_interval: Option<Duration>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn SensorStore>, registry: Arc<MetricsRegistry>, write_timeout: Duration) -> Self {
        Self {
            store: Some(store),
            registry,
            available: AtomicBool::new(true),
            init: Mutex::new(InitState::default()),
            write_timeout,
            recovery_interval: None,
        }
    }

    /// A gateway with no backing store: every write is refused.
    pub fn unconfigured(registry: Arc<MetricsRegistry>) -> Self {
        warn!("no database configured, sensor records will only be logged");
        Self {
            store: None,
            registry,
            available: AtomicBool::new(false),
            init: Mutex::new(InitState::default()),
            write_timeout: Duration::ZERO,
            recovery_interval: None,
        }
    }

    /// Allow a re-initialisation attempt at most once per `interval` after the
    /// gateway has latched unavailable.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = Some(interval);
        self
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    #[instrument(skip_all, fields(device_id = %device_id, topic = %topic))]
    pub async fn write(
        &self,
        device_id: &str,
        topic: &str,
        data: Value,
        timestamp: OffsetDateTime,
    ) -> Result<i64, PersistenceError> {
        let record = NewSensorRecord {
            device_id: device_id.to_owned(),
            topic: topic.to_owned(),
            data,
            timestamp,
        };

        let usable = self.store.is_some() && (self.is_available() || self.try_recover().await);
        let store = match &self.store {
            Some(store) if usable => store,
            _ => {
                self.registry.count_db_write("unavailable");
                debug!(data = %record.data, "database unavailable, record not persisted");
                return Err(PersistenceError::Unavailable);
            }
        };

        self.ensure_ready(store.as_ref()).await?;

        match tokio::time::timeout(self.write_timeout, store.insert(&record)).await {
            Ok(Ok(id)) => {
                self.registry.count_db_write("ok");
                debug!(id, "sensor record stored");
                Ok(id)
            }
            Ok(Err(e)) => {
                self.registry.count_db_write("failed");
                error!(error = %e, data = %record.data, "failed to store sensor record");
                Err(PersistenceError::Write(e))
            }
            Err(_) => {
                self.registry.count_db_write("timeout");
                error!(timeout = ?self.write_timeout, data = %record.data, "sensor record write timed out");
                Err(PersistenceError::Timeout(self.write_timeout))
            }
        }
    }

    pub async fn recorded_devices(&self) -> Result<Vec<String>, PersistenceError> {
        let store = self.readable_store().await?;
        self.bounded_read(store.recorded_devices()).await
    }

    pub async fn device_records(
        &self,
        device_id: &str,
        query: &RecordQuery,
    ) -> Result<Vec<SensorRecord>, PersistenceError> {
        let store = self.readable_store().await?;
        self.bounded_read(store.device_records(device_id, query)).await
    }

    pub async fn stats(&self) -> Result<StoreStats, PersistenceError> {
        let store = self.readable_store().await?;
        self.bounded_read(store.stats()).await
    }

    /// Reads follow the same availability rules as writes, including lazy
    /// initialisation and the latch.
    async fn readable_store(&self) -> Result<&dyn SensorStore, PersistenceError> {
        let usable = self.store.is_some() && (self.is_available() || self.try_recover().await);
        match &self.store {
            Some(store) if usable => {
                self.ensure_ready(store.as_ref()).await?;
                Ok(store.as_ref())
            }
            _ => Err(PersistenceError::Unavailable),
        }
    }

    async fn bounded_read<T>(
        &self,
        query: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, PersistenceError> {
        match tokio::time::timeout(self.write_timeout, query).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(e)) => {
                warn!(error = %e, "sensor data query failed");
                Err(PersistenceError::Query(e))
            }
            Err(_) => {
                warn!(timeout = ?self.write_timeout, "sensor data query timed out");
                Err(PersistenceError::Timeout(self.write_timeout))
            }
        }
    }

    async fn ensure_ready(&self, store: &dyn SensorStore) -> Result<(), PersistenceError> {
        let mut state = self.init.lock().await;
        if !self.is_available() {
            // Another writer latched while we waited for the lock.
            return Err(PersistenceError::Unavailable);
        }

        if !store.is_connected() {
            info!("connecting to database");
            if let Err(e) = store.connect().await {
                return Err(self.latch_unavailable(&mut state, e));
            }
        }

        if !state.schema_ready {
            if let Err(e) = store.ensure_schema().await {
                return Err(self.latch_unavailable(&mut state, e));
            }
            state.schema_ready = true;
            info!("database schema ready");
        }
        Ok(())
    }

    fn latch_unavailable(&self, state: &mut InitState, e: anyhow::Error) -> PersistenceError {
        self.available.store(false, Ordering::Release);
        state.unavailable_since = Some(Instant::now());
        self.registry.count_db_write("init_failed");
        match self.recovery_interval {
            Some(interval) => warn!(error = %e, retry_after = ?interval, "database initialization failed, persistence disabled"),
            None => warn!(error = %e, "database initialization failed, persistence disabled until restart"),
        }
        PersistenceError::Initialization(e)
    }

    async fn try_recover(&self) -> bool {
        let Some(interval) = self.recovery_interval else {
            return false;
        };
        let mut state = self.init.lock().await;
        if self.is_available() {
            return true;
        }
        match state.unavailable_since {
            Some(since) if since.elapsed() >= interval => {
                info!("probing database after earlier initialization failure");
                state.unavailable_since = None;
                self.available.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub(crate) struct MockStore {
        pub connected: AtomicBool,
        pub fail_connect: AtomicBool,
        pub fail_schema: AtomicBool,
        pub fail_insert: AtomicBool,
        pub insert_delay: StdMutex<Option<Duration>>,
        pub connect_calls: StdMutex<u32>,
        pub schema_calls: StdMutex<u32>,
        pub records: StdMutex<Vec<SensorRecord>>,
    }

    impl MockStore {
        pub fn records(&self) -> Vec<SensorRecord> {
            self.records.lock().unwrap().clone()
        }

        pub fn connect_calls(&self) -> u32 {
            *self.connect_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SensorStore for MockStore {
        async fn connect(&self) -> anyhow::Result<()> {
            *self.connect_calls.lock().unwrap() += 1;
            if self.fail_connect.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn ensure_schema(&self) -> anyhow::Result<()> {
            *self.schema_calls.lock().unwrap() += 1;
            if self.fail_schema.load(Ordering::SeqCst) {
                anyhow::bail!("permission denied for schema public");
            }
            Ok(())
        }

        async fn insert(&self, record: &NewSensorRecord) -> anyhow::Result<i64> {
            let delay = *self.insert_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_insert.load(Ordering::SeqCst) {
                anyhow::bail!("value too long for type");
            }
            let mut records = self.records.lock().unwrap();
            let id = records.len() as i64 + 1;
            records.push(SensorRecord::from_new(id, record.clone()));
            Ok(id)
        }

        async fn recorded_devices(&self) -> anyhow::Result<Vec<String>> {
            let devices: BTreeSet<String> =
                self.records().into_iter().map(|record| record.device_id).collect();
            Ok(devices.into_iter().collect())
        }

        async fn device_records(&self, device_id: &str, query: &RecordQuery) -> anyhow::Result<Vec<SensorRecord>> {
            let mut records: Vec<SensorRecord> = self
                .records()
                .into_iter()
                .filter(|record| record.device_id == device_id && query.matches(record))
                .collect();
            records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            records.truncate(query.limit as usize);
            Ok(records)
        }

        async fn stats(&self) -> anyhow::Result<StoreStats> {
            let records = self.records();
            Ok(StoreStats {
                device_count: self.recorded_devices().await?.len() as i64,
                message_count: records.len() as i64,
                last_message_time: records.iter().map(|record| record.timestamp).max(),
            })
        }
    }

    fn gateway(store: Arc<MockStore>) -> PersistenceGateway {
        PersistenceGateway::new(store, Arc::new(MetricsRegistry::new()), Duration::from_secs(1))
    }

    async fn write(gateway: &PersistenceGateway, device_id: &str) -> Result<i64, PersistenceError> {
        gateway
            .write(device_id, "sensors/d/data", serde_json::json!({ "deviceId": device_id }), OffsetDateTime::now_utc())
            .await
    }

    #[tokio::test]
    async fn test_lazy_init_runs_once() {
        let store = Arc::new(MockStore::default());
        let gateway = gateway(store.clone());
        assert_eq!(store.connect_calls(), 0);

        assert_eq!(write(&gateway, "d1").await.unwrap(), 1);
        assert_eq!(write(&gateway, "d2").await.unwrap(), 2);

        assert_eq!(store.connect_calls(), 1);
        assert_eq!(*store.schema_calls.lock().unwrap(), 1);
        let records = store.records();
        assert_eq!(records[0].device_id, "d1");
        assert_eq!(records[1].data["deviceId"], "d2");
    }

    #[tokio::test]
    async fn test_connect_failure_latches_permanently() {
        let store = Arc::new(MockStore::default());
        store.fail_connect.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone());

        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Initialization(_))));
        assert!(!gateway.is_available());

        // Even once the backend is healthy again nothing is retried.
        store.fail_connect.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Unavailable)));
        }
        assert_eq!(store.connect_calls(), 1);
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_schema_failure_latches() {
        let store = Arc::new(MockStore::default());
        store.fail_schema.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone());

        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Initialization(_))));
        assert!(!gateway.is_available());
    }

    #[tokio::test]
    async fn test_insert_failure_is_transient() {
        let store = Arc::new(MockStore::default());
        let gateway = gateway(store.clone());

        store.fail_insert.store(true, Ordering::SeqCst);
        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Write(_))));
        assert!(gateway.is_available());

        store.fail_insert.store(false, Ordering::SeqCst);
        assert!(write(&gateway, "d1").await.is_ok());
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_handle_is_reopened() {
        let store = Arc::new(MockStore::default());
        let gateway = gateway(store.clone());
        write(&gateway, "d1").await.unwrap();

        store.connected.store(false, Ordering::SeqCst);
        write(&gateway, "d1").await.unwrap();

        assert_eq!(store.connect_calls(), 2);
        assert_eq!(*store.schema_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_slow_insert_times_out_without_latching() {
        let store = Arc::new(MockStore::default());
        *store.insert_delay.lock().unwrap() = Some(Duration::from_millis(200));
        let gateway = PersistenceGateway::new(store.clone(), Arc::new(MetricsRegistry::new()), Duration::from_millis(10));

        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Timeout(_))));
        assert!(gateway.is_available());
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_refuses_writes() {
        let gateway = PersistenceGateway::unconfigured(Arc::new(MetricsRegistry::new()));
        assert!(!gateway.is_available());
        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Unavailable)));
    }

    #[tokio::test]
    async fn test_recovery_probe_after_interval() {
        let store = Arc::new(MockStore::default());
        store.fail_connect.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone()).with_recovery_interval(Duration::ZERO);

        assert!(write(&gateway, "d1").await.is_err());
        assert!(!gateway.is_available());

        store.fail_connect.store(false, Ordering::SeqCst);
        assert_eq!(write(&gateway, "d1").await.unwrap(), 1);
        assert!(gateway.is_available());
        assert_eq!(store.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_recovery_probe_waits_for_interval() {
        let store = Arc::new(MockStore::default());
        store.fail_connect.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone()).with_recovery_interval(Duration::from_secs(3600));

        assert!(write(&gateway, "d1").await.is_err());
        store.fail_connect.store(false, Ordering::SeqCst);

        assert!(matches!(write(&gateway, "d1").await, Err(PersistenceError::Unavailable)));
        assert_eq!(store.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_reads_return_stored_history() {
        let store = Arc::new(MockStore::default());
        let gateway = gateway(store.clone());
        write(&gateway, "d2").await.unwrap();
        write(&gateway, "d1").await.unwrap();
        write(&gateway, "d1").await.unwrap();

        assert_eq!(gateway.recorded_devices().await.unwrap(), vec!["d1", "d2"]);

        let history = gateway.device_records("d1", &RecordQuery::new(Some(1), None, None)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 3);

        let stats = gateway.stats().await.unwrap();
        assert_eq!(stats.device_count, 2);
        assert_eq!(stats.message_count, 3);
        assert!(stats.last_message_time.is_some());
    }

    #[tokio::test]
    async fn test_reads_refused_while_latched() {
        let store = Arc::new(MockStore::default());
        store.fail_connect.store(true, Ordering::SeqCst);
        let gateway = gateway(store.clone());

        assert!(matches!(gateway.stats().await, Err(PersistenceError::Initialization(_))));
        assert!(matches!(gateway.recorded_devices().await, Err(PersistenceError::Unavailable)));
        assert_eq!(store.connect_calls(), 1);

        let unconfigured = PersistenceGateway::unconfigured(Arc::new(MetricsRegistry::new()));
        assert!(matches!(
            unconfigured.device_records("d1", &RecordQuery::default()).await,
            Err(PersistenceError::Unavailable)
        ));
    }
}
