use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time;

/// One message per microsecond is the finest interval tokio can tick.
const MAX_RATE: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish synthetic sensor telemetry", long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Number of simulated devices
    #[arg(long, default_value_t = 3)]
    devices: u32,

    /// Messages per second (Total throughput target)
    #[arg(long, default_value_t = 10)]
    rate: u64,

    /// Duration of test in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Percentage of messages sent without a deviceId, to exercise the drop path
    #[arg(long, default_value_t = 0)]
    anonymous_percent: u8,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    temperature: f64,
    humidity: f64,
    timestamp: String, // RFC 3339
}

/// Spacing between publishes for a total rate in messages per second.
fn send_interval(rate: u64) -> anyhow::Result<Duration> {
    anyhow::ensure!(
        (1..=MAX_RATE).contains(&rate),
        "--rate must be between 1 and {MAX_RATE}"
    );
    Ok(Duration::from_micros(1_000_000 / rate))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    anyhow::ensure!(args.devices > 0, "--devices must be at least 1");
    println!("Starting Load Tester with config: {:?}", args);

    // 1. Setup MQTT Client
    let client_id = format!("load_tester_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    // Spawn Event Loop in background to handle network traffic
    tokio::spawn(async move {
        while eventloop.poll().await.is_ok() {
            // Just drain the event loop
        }
    });

    // 2. Load Generation Loop
    let start_time = std::time::Instant::now();
    let interval_duration = send_interval(args.rate)?;
    let mut interval = time::interval(interval_duration);
    let mut total_sent: u64 = 0;

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {:?}s elapsed. Stopping.", args.duration);
            break;
        }

        // Round-robin over devices
        let device_idx = (total_sent % args.devices as u64) + 1;
        let device_id = format!("device_{:03}", device_idx);

        let mut rng = rand::thread_rng();
        let anonymous = rng.gen_range(0..100u8) < args.anonymous_percent;
        let payload = SensorPayload {
            device_id: (!anonymous).then(|| device_id.clone()),
            temperature: rng.gen_range(15.0..35.0),
            humidity: rng.gen_range(30.0..100.0),
            timestamp: ::time::OffsetDateTime::now_utc()
                .format(&::time::format_description::well_known::Rfc3339)?,
        };

        let topic = format!("sensors/{}/data", device_id);
        let payload_json = serde_json::to_vec(&payload)?;

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload_json).await {
            eprintln!("Failed to publish: {:?}", e);
        }

        total_sent += 1;

        if total_sent % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    println!("Load Test Complete. Total messages sent: {}", total_sent);
    Ok(())
}
