use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use crate::domain::DeviceSnapshot;

pub const MESSAGES_TOTAL: &str = "mqtt_messages_total";
pub const TEMPERATURE: &str = "sensor_temperature_celsius";
pub const HUMIDITY: &str = "sensor_humidity_percent";
pub const LAST_SEEN: &str = "sensor_last_seen_timestamp_seconds";
pub const STRESS_INDEX: &str = "sensor_stress_index";
pub const PAYLOAD_ERRORS: &str = "ingest_payload_errors_total";
pub const DB_WRITES: &str = "db_writes_total";
pub const CONNECTION_EVENTS: &str = "mqtt_connection_events_total";

/// Owned metrics state shared between the ingest worker (sole writer) and
/// the status surface (readers).
///
/// The Prometheus recorder is never installed globally; every macro call is
/// scoped to it with `metrics::with_local_recorder`, so two registries in the
/// same process never see each other's series.
pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    devices: DashMap<String, DeviceSnapshot>,
    message_counts: DashMap<(String, String), u64>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe_counter!(MESSAGES_TOTAL, "Total MQTT messages received");
            describe_gauge!(TEMPERATURE, "Last reported temperature per device");
            describe_gauge!(HUMIDITY, Unit::Percent, "Last reported humidity per device");
            describe_gauge!(LAST_SEEN, Unit::Seconds, "Unix time of the last message per device");
            describe_gauge!(STRESS_INDEX, "Derived temperature/humidity stress indicator (0-1)");
            describe_counter!(PAYLOAD_ERRORS, "Payloads dropped before metric derivation");
            describe_counter!(DB_WRITES, "Persistence attempts by outcome");
            describe_counter!(CONNECTION_EVENTS, "Transport connectivity transitions");
        });

        Self {
            recorder,
            handle,
            devices: DashMap::new(),
            message_counts: DashMap::new(),
        }
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.recorder, f)
    }

    pub fn record_message(&self, topic: &str, device_id: &str) {
        *self
            .message_counts
            .entry((topic.to_owned(), device_id.to_owned()))
            .or_insert(0) += 1;
        self.scoped(|| {
            counter!(MESSAGES_TOTAL, "topic" => topic.to_owned(), "device_id" => device_id.to_owned())
                .increment(1)
        });
    }

    pub fn set_temperature(&self, device_id: &str, value: f64) {
        self.devices.entry(device_id.to_owned()).or_default().temperature = Some(value);
        self.set_device_gauge(TEMPERATURE, device_id, value);
    }

    pub fn set_humidity(&self, device_id: &str, value: f64) {
        self.devices.entry(device_id.to_owned()).or_default().humidity = Some(value);
        self.set_device_gauge(HUMIDITY, device_id, value);
    }

    pub fn set_last_seen(&self, device_id: &str, unix_seconds: i64) {
        self.devices.entry(device_id.to_owned()).or_default().last_seen_timestamp = unix_seconds;
        self.set_device_gauge(LAST_SEEN, device_id, unix_seconds as f64);
    }

    pub fn set_stress_index(&self, device_id: &str, value: f64) {
        self.devices.entry(device_id.to_owned()).or_default().stress_index = Some(value);
        self.set_device_gauge(STRESS_INDEX, device_id, value);
    }

    fn set_device_gauge(&self, name: &'static str, device_id: &str, value: f64) {
        self.scoped(|| gauge!(name, "device_id" => device_id.to_owned()).set(value));
    }

    pub fn count_payload_error(&self, kind: &'static str) {
        self.scoped(|| counter!(PAYLOAD_ERRORS, "kind" => kind).increment(1));
    }

    pub fn count_db_write(&self, outcome: &'static str) {
        self.scoped(|| counter!(DB_WRITES, "outcome" => outcome).increment(1));
    }

    pub fn count_connection_event(&self, event: &'static str) {
        self.scoped(|| counter!(CONNECTION_EVENTS, "event" => event).increment(1));
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.devices.get(device_id).map(|snapshot| snapshot.clone())
    }

    /// All known devices, ordered by id.
    pub fn devices(&self) -> Vec<(String, DeviceSnapshot)> {
        let mut devices: Vec<_> = self
            .devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn message_count(&self, topic: &str, device_id: &str) -> u64 {
        self.message_counts
            .get(&(topic.to_owned(), device_id.to_owned()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Messages for a device summed over every topic it published on.
    pub fn device_message_count(&self, device_id: &str) -> u64 {
        self.message_counts
            .iter()
            .filter(|entry| entry.key().1 == device_id)
            .map(|entry| *entry.value())
            .sum()
    }

    /// Prometheus text exposition of every series in this registry.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
