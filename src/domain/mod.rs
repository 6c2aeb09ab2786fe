pub mod error;

use rumqttc::QoS;
use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub use error::{PayloadError, PersistenceError, TransportError};

/// One inbound publish, alive only for the duration of its processing.
#[derive(Debug, Clone)]
pub struct TelemetryMessage {
    pub topic: String,
    pub raw_payload: Vec<u8>,
    pub qos: QoS,
    pub duplicate: bool,
    pub retain: bool,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<String>, raw_payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            raw_payload: raw_payload.into(),
            qos: QoS::AtLeastOnce,
            duplicate: false,
            retain: false,
        }
    }
}

/// Parsed form of a telemetry payload.
///
/// `fields` keeps the whole JSON object verbatim (including `deviceId`,
/// `temperature` and `humidity`) so it can be stored as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub device_id: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub fields: Map<String, Value>,
}

impl DecodedReading {
    pub fn decode(raw: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(raw)?;
        let fields = match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => fields,
            _ => return Err(PayloadError::NotAnObject),
        };

        // A non-string or empty deviceId is as good as none.
        let device_id = fields
            .get("deviceId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_owned);
        let temperature = fields.get("temperature").and_then(Value::as_f64);
        let humidity = fields.get("humidity").and_then(Value::as_f64);

        Ok(Self {
            device_id,
            temperature,
            humidity,
            fields,
        })
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// A row about to be written to `sensor_data`.
#[derive(Debug, Clone, Serialize)]
pub struct NewSensorRecord {
    pub device_id: String,
    pub topic: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A row as stored, with its backend-assigned id.
#[derive(Debug, Clone, Serialize)]
pub struct SensorRecord {
    pub id: i64,
    pub device_id: String,
    pub topic: String,
    pub data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SensorRecord {
    pub fn from_new(id: i64, record: NewSensorRecord) -> Self {
        Self {
            id,
            device_id: record.device_id,
            topic: record.topic,
            data: record.data,
            timestamp: record.timestamp,
        }
    }
}

/// Filter for a device's stored history, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub limit: i64,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
}

impl RecordQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    /// Out-of-range limits are clamped rather than rejected.
    pub fn new(limit: Option<i64>, from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> Self {
        Self {
            limit: limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT),
            from,
            to,
        }
    }

    pub fn matches(&self, record: &SensorRecord) -> bool {
        self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
    }
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

/// A device that has at least one stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedDevice {
    pub device_id: String,
}

/// Totals over everything stored in `sensor_data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub device_count: i64,
    pub message_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_time: Option<OffsetDateTime>,
}

/// Last known state of one device. Gauges that were never observed stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub last_seen_timestamp: i64,
    pub stress_index: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub mqtt_connected: bool,
    pub database_available: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
