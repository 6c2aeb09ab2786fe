pub mod http;
pub mod mqtt;
pub mod postgres;
pub use mqtt::MqttAdapter;
pub use postgres::PostgresSensorStore;
