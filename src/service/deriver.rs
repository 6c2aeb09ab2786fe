use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;
use crate::domain::DecodedReading;
use crate::state::MetricsRegistry;

const TEMPERATURE_THRESHOLD_C: f64 = 18.0;
const TEMPERATURE_SPAN_C: f64 = 10.0;
const HUMIDITY_THRESHOLD_PCT: f64 = 50.0;
const HUMIDITY_SPAN_PCT: f64 = 50.0;

/// Composite stress indicator in [0, 1], rounded to two decimals.
///
/// Mean of two clamped linear ramps: temperature from 18 °C (0) to 28 °C (1)
/// and humidity from 50 % (0) to 100 % (1). The sum is capped at 1.
/// Halfway cases round to even, so 0.125 becomes 0.12.
pub fn stress_index(temperature: f64, humidity: f64) -> f64 {
    let temp_factor = ((temperature - TEMPERATURE_THRESHOLD_C) / TEMPERATURE_SPAN_C).max(0.0);
    let humidity_factor = ((humidity - HUMIDITY_THRESHOLD_PCT) / HUMIDITY_SPAN_PCT).max(0.0);
    let stress = ((temp_factor + humidity_factor) / 2.0).min(1.0);
    (stress * 100.0).round_ties_even() / 100.0
}

/// Turns one reading into exporter updates.
pub struct MetricDeriver {
    registry: Arc<MetricsRegistry>,
}

impl MetricDeriver {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn derive(&self, topic: &str, device_id: &str, reading: &DecodedReading) {
        self.derive_at(topic, device_id, reading, OffsetDateTime::now_utc().unix_timestamp());
    }

    /// Last-seen is set on every message, even one with no gauges, so a device
    /// that only sends heartbeats still shows as alive. A missing input leaves
    /// the previous stress value in place.
    pub fn derive_at(&self, topic: &str, device_id: &str, reading: &DecodedReading, now_unix: i64) {
        self.registry.record_message(topic, device_id);

        if let Some(temperature) = reading.temperature {
            self.registry.set_temperature(device_id, temperature);
        }
        if let Some(humidity) = reading.humidity {
            self.registry.set_humidity(device_id, humidity);
        }
        self.registry.set_last_seen(device_id, now_unix);

        if let (Some(temperature), Some(humidity)) = (reading.temperature, reading.humidity) {
            let stress = stress_index(temperature, humidity);
            debug!(device_id, stress, "stress index updated");
            self.registry.set_stress_index(device_id, stress);
        }
    }
}
