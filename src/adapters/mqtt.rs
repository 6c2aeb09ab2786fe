use async_trait::async_trait;
use anyhow::Context;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Proxy, ProxyAuth, ProxyType,
    Publish, QoS, SubscribeReasonCode, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, instrument, warn};
use crate::config::AppConfig;
use crate::domain::{TelemetryMessage, TransportError};
use crate::ports::TransportHandle;
use crate::state::ConnectionTracker;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

pub struct MqttAdapter {
    client: AsyncClient,
}

impl MqttAdapter {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Persistent session (clean_session = false) so the broker keeps our
    /// subscription and queues QoS 1 messages across short outages.
    pub fn options(config: &AppConfig) -> anyhow::Result<MqttOptions> {
        let mut options = MqttOptions::new(&config.client_id, &config.endpoint, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(false);

        if let Some(ca_path) = &config.ca_file {
            let ca = std::fs::read(ca_path)
                .with_context(|| format!("reading CA file {}", ca_path.display()))?;
            let client_auth = match (&config.cert, &config.key) {
                (Some(cert_path), Some(key_path)) => {
                    let cert = std::fs::read(cert_path)
                        .with_context(|| format!("reading certificate {}", cert_path.display()))?;
                    let key = std::fs::read(key_path)
                        .with_context(|| format!("reading private key {}", key_path.display()))?;
                    Some((cert, key))
                }
                _ => None,
            };
            options.set_transport(Transport::tls(ca, client_auth, None));
        }

        if let Some((host, port)) = config.proxy() {
            info!(proxy_host = %host, proxy_port = port, "using HTTP proxy");
            options.set_proxy(Proxy {
                ty: ProxyType::Http,
                auth: ProxyAuth::None,
                addr: host,
                port,
            });
        }

        Ok(options)
    }

    pub fn build(config: &AppConfig) -> anyhow::Result<(AsyncClient, EventLoop)> {
        let options = Self::options(config)?;
        Ok(AsyncClient::new(options, 100))
    }
}

#[async_trait]
impl TransportHandle for MqttAdapter {
    #[instrument(skip_all, fields(topic = %topic))]
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Subscribe Failed: {:?}", e))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| anyhow::anyhow!("MQTT Disconnect Failed: {:?}", e))
    }
}

pub fn to_message(publish: Publish) -> TelemetryMessage {
    TelemetryMessage {
        topic: publish.topic,
        raw_payload: publish.payload.to_vec(),
        qos: publish.qos,
        duplicate: publish.dup,
        retain: publish.retain,
    }
}

/// Granted QoS per requested filter; `None` where the broker refused it.
pub fn granted_qos(return_codes: &[SubscribeReasonCode]) -> Vec<Option<QoS>> {
    return_codes
        .iter()
        .map(|code| match code {
            SubscribeReasonCode::Success(qos) => Some(*qos),
            SubscribeReasonCode::Failure => None,
        })
        .collect()
}

/// What the poll loop should do after one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Connection error: wait before polling again so rumqttc reconnects.
    Backoff,
    /// Orderly disconnect finished.
    Stop,
}

/// Connection history the event mapping depends on.
#[derive(Debug, Default)]
pub struct LoopState {
    has_connected: bool,
    closing: bool,
}

/// Map one poll result onto the tracker and the ingest channel.
///
/// The first ConnAck is the initial connect, later ones are resumptions. A
/// poll error is a failed connect until the tracker reports connected, and an
/// interruption afterwards. Errors after our own Disconnect end the loop.
pub async fn handle_event(
    event: Result<Event, ConnectionError>,
    state: &mut LoopState,
    tracker: &ConnectionTracker,
    sender: &Sender<TelemetryMessage>,
) -> Result<LoopControl, TransportError> {
    match event {
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            if sender.send(to_message(publish)).await.is_err() {
                warn!("ingest channel closed, dropping message");
            }
        }
        Ok(Event::Incoming(Packet::ConnAck(connack))) => {
            if state.has_connected {
                tracker.on_resumed(connack.code, connack.session_present).await?;
            } else {
                state.has_connected = true;
                info!(session_present = connack.session_present, "connected to MQTT broker");
                tracker.on_connect_success();
            }
        }
        Ok(Event::Incoming(Packet::SubAck(suback))) => {
            tracker.on_subscribe_complete(suback.pkid, &granted_qos(&suback.return_codes))?;
        }
        Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
            tracker.bind_subscribe_packet(pkid);
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
            state.closing = true;
            tracker.on_closed();
        }
        Ok(_) => {}
        Err(e) => {
            if state.closing {
                debug!(error = %e, "event loop stopped after disconnect");
                return Ok(LoopControl::Stop);
            }
            if tracker.is_connected() {
                tracker.on_interrupted(&e);
            } else {
                tracker.on_connection_failure(&e);
            }
            return Ok(LoopControl::Backoff);
        }
    }
    Ok(LoopControl::Continue)
}

/// Drive the rumqttc event loop: feed connection events to the tracker and
/// queue publishes for the ingest worker.
///
/// Returns `Ok` after an orderly disconnect, or the fatal error that ended
/// the loop (a rejected subscription). Connection errors are not fatal:
/// polling again makes rumqttc reconnect.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    tracker: Arc<ConnectionTracker>,
    sender: Sender<TelemetryMessage>,
) -> Result<(), TransportError> {
    let mut state = LoopState::default();
    loop {
        let event = eventloop.poll().await;
        match handle_event(event, &mut state, &tracker, &sender).await? {
            LoopControl::Continue => {}
            LoopControl::Backoff => tokio::time::sleep(RECONNECT_BACKOFF).await,
            LoopControl::Stop => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rumqttc::{ConnAck, ConnectReturnCode, SubAck};
    use tokio::sync::mpsc;
    use crate::state::connection::tests::MockTransport;
    use crate::state::MetricsRegistry;

    fn config(args: &[&str]) -> AppConfig {
        let mut argv = vec!["telemetry-ingestor", "--endpoint", "broker.local", "--port", "1883"];
        argv.extend_from_slice(args);
        AppConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_options_use_persistent_session() {
        let options = MqttAdapter::options(&config(&["--client-id", "collector-1"])).unwrap();
        assert_eq!(options.client_id(), "collector-1");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
    }

    #[test]
    fn test_missing_ca_file_is_reported() {
        let err = MqttAdapter::options(&config(&["--ca-file", "/nonexistent/root-CA.crt"])).unwrap_err();
        assert!(format!("{err:#}").contains("root-CA.crt"));
    }

    #[test]
    fn test_granted_qos_maps_failures_to_none() {
        let granted = granted_qos(&[
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
            SubscribeReasonCode::Failure,
        ]);
        assert_eq!(granted, vec![Some(QoS::AtLeastOnce), None]);
    }

    #[test]
    fn test_publish_becomes_message() {
        let mut publish = Publish::new("sensors/d1/data", QoS::AtLeastOnce, br#"{"deviceId":"d1"}"#.to_vec());
        publish.dup = true;
        let message = to_message(publish);

        assert_eq!(message.topic, "sensors/d1/data");
        assert_eq!(message.raw_payload, br#"{"deviceId":"d1"}"#);
        assert_eq!(message.qos, QoS::AtLeastOnce);
        assert!(message.duplicate);
        assert!(!message.retain);
    }

    struct Harness {
        tracker: ConnectionTracker,
        transport: Arc<MockTransport>,
        registry: Arc<MetricsRegistry>,
        state: LoopState,
        sender: Sender<TelemetryMessage>,
        receiver: mpsc::Receiver<TelemetryMessage>,
    }

    impl Harness {
        fn new() -> Self {
            let transport = Arc::new(MockTransport::default());
            let registry = Arc::new(MetricsRegistry::new());
            let tracker = ConnectionTracker::new(transport.clone(), registry.clone());
            let (sender, receiver) = mpsc::channel(8);
            Self { tracker, transport, registry, state: LoopState::default(), sender, receiver }
        }

        async fn feed(&mut self, event: Result<Event, ConnectionError>) -> Result<LoopControl, TransportError> {
            handle_event(event, &mut self.state, &self.tracker, &self.sender).await
        }
    }

    fn connack(session_present: bool) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Success,
        })))
    }

    fn suback(pkid: u16, code: SubscribeReasonCode) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::SubAck(SubAck { pkid, return_codes: vec![code] })))
    }

    fn io_error() -> Result<Event, ConnectionError> {
        Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }

    #[tokio::test]
    async fn test_error_before_connect_is_a_failure() {
        let mut h = Harness::new();

        assert_eq!(h.feed(io_error()).await.unwrap(), LoopControl::Backoff);
        assert!(!h.tracker.is_connected());
        assert!(h.registry.render().contains(r#"event="failed""#));
    }

    #[tokio::test]
    async fn test_first_connack_connects_and_error_interrupts() {
        let mut h = Harness::new();

        assert_eq!(h.feed(connack(false)).await.unwrap(), LoopControl::Continue);
        assert!(h.tracker.is_connected());
        assert!(h.transport.subscribed.lock().unwrap().is_empty());

        assert_eq!(h.feed(io_error()).await.unwrap(), LoopControl::Backoff);
        assert!(!h.tracker.is_connected());
        let rendered = h.registry.render();
        assert!(rendered.contains(r#"event="connected""#));
        assert!(rendered.contains(r#"event="interrupted""#));
    }

    #[tokio::test]
    async fn test_publish_is_forwarded_to_worker() {
        let mut h = Harness::new();
        let publish = Publish::new("sensors/d1/data", QoS::AtLeastOnce, br#"{"deviceId":"d1"}"#.to_vec());

        let control = h.feed(Ok(Event::Incoming(Packet::Publish(publish)))).await.unwrap();

        assert_eq!(control, LoopControl::Continue);
        let message = h.receiver.try_recv().unwrap();
        assert_eq!(message.topic, "sensors/d1/data");
    }

    #[tokio::test]
    async fn test_rejected_resubscription_ends_loop() {
        let mut h = Harness::new();
        h.tracker.subscribe("sensors/+/data").await.unwrap();
        h.feed(Ok(Event::Outgoing(Outgoing::Subscribe(1)))).await.unwrap();
        h.feed(connack(false)).await.unwrap();
        h.feed(suback(1, SubscribeReasonCode::Success(QoS::AtLeastOnce))).await.unwrap();
        h.feed(io_error()).await.unwrap();

        // Broker lost the session: the filter is requested again.
        assert_eq!(h.feed(connack(false)).await.unwrap(), LoopControl::Continue);
        assert!(h.tracker.is_connected());
        assert_eq!(*h.transport.subscribed.lock().unwrap(), vec!["sensors/+/data", "sensors/+/data"]);

        h.feed(Ok(Event::Outgoing(Outgoing::Subscribe(2)))).await.unwrap();
        let err = h.feed(suback(2, SubscribeReasonCode::Failure)).await.unwrap_err();
        match err {
            TransportError::SubscriptionRejected { topic } => assert_eq!(topic, "sensors/+/data"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resume_with_session_skips_resubscribe() {
        let mut h = Harness::new();
        h.tracker.subscribe("sensors/+/data").await.unwrap();
        h.feed(connack(false)).await.unwrap();
        h.feed(io_error()).await.unwrap();

        h.feed(connack(true)).await.unwrap();

        assert!(h.tracker.is_connected());
        assert_eq!(h.transport.subscribed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_closes_then_stops() {
        let mut h = Harness::new();
        h.feed(connack(false)).await.unwrap();

        assert_eq!(h.feed(Ok(Event::Outgoing(Outgoing::Disconnect))).await.unwrap(), LoopControl::Continue);
        assert!(!h.tracker.is_connected());
        assert!(h.registry.render().contains(r#"event="closed""#));

        assert_eq!(h.feed(io_error()).await.unwrap(), LoopControl::Stop);
    }
}
