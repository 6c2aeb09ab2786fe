use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use clap::Parser;

/// Process configuration. Every flag can also come from the environment
/// (or a `.env` file).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Ingest sensor telemetry from an MQTT broker", long_about = None)]
pub struct AppConfig {
    /// MQTT broker host, without port
    #[arg(long, env = "MQTT_ENDPOINT")]
    pub endpoint: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 8883)]
    pub port: u16,

    /// Root CA certificate (PEM). Enables TLS.
    #[arg(long, env = "MQTT_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long, env = "MQTT_CERT")]
    pub cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "MQTT_KEY")]
    pub key: Option<PathBuf>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "mqtt-service")]
    pub client_id: String,

    /// Topic filter to subscribe to
    #[arg(long, env = "MQTT_TOPIC", default_value = "sensors/+/data")]
    pub topic: String,

    /// Number of messages to receive before exiting. 0 = unlimited.
    #[arg(long, env = "MESSAGE_COUNT", default_value_t = 0)]
    pub count: u64,

    /// HTTP proxy host for the broker connection
    #[arg(long, env = "MQTT_PROXY_HOST")]
    pub proxy_host: Option<String>,

    #[arg(long, env = "MQTT_PROXY_PORT", default_value_t = 8080)]
    pub proxy_port: u16,

    /// First port tried for the health/metrics server
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub http_port: u16,

    /// How many consecutive ports to try before giving up
    #[arg(long, env = "HTTP_PORT_ATTEMPTS", default_value_t = 10)]
    pub http_port_attempts: u16,

    /// Postgres connection string. Without it readings are only logged.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "DB_WRITE_TIMEOUT_SECS", default_value_t = 5)]
    pub db_write_timeout_secs: u64,

    /// Retry database initialisation this often after a failure. 0 = never.
    #[arg(long, env = "DB_RECOVERY_INTERVAL_SECS", default_value_t = 0)]
    pub db_recovery_interval_secs: u64,

    /// Capacity of the queue between the MQTT event loop and the ingest worker
    #[arg(long, env = "INGEST_CHANNEL_CAPACITY", default_value_t = 1024)]
    pub channel_capacity: usize,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub verbosity: String,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cert.is_some() != self.key.is_some() {
            bail!("--cert and --key must be given together");
        }
        if self.cert.is_some() && self.ca_file.is_none() {
            bail!("client certificates require --ca-file");
        }
        if self.channel_capacity == 0 {
            bail!("--channel-capacity must be at least 1");
        }
        if self.http_port_attempts == 0 {
            bail!("--http-port-attempts must be at least 1");
        }
        Ok(())
    }

    /// Proxy settings, only when a host is given and the port is non-zero.
    pub fn proxy(&self) -> Option<(String, u16)> {
        match &self.proxy_host {
            Some(host) if !host.is_empty() && self.proxy_port != 0 => Some((host.clone(), self.proxy_port)),
            _ => None,
        }
    }

    pub fn db_write_timeout(&self) -> Duration {
        Duration::from_secs(self.db_write_timeout_secs)
    }

    pub fn db_recovery_interval(&self) -> Option<Duration> {
        (self.db_recovery_interval_secs > 0).then(|| Duration::from_secs(self.db_recovery_interval_secs))
    }
}
