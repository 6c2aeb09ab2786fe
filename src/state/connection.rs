use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use rumqttc::{ConnectReturnCode, QoS};
use tracing::{error, info, warn};
use crate::domain::TransportError;
use crate::ports::TransportHandle;
use crate::state::metrics_registry::MetricsRegistry;

#[derive(Debug, Default)]
struct SubscriptionBook {
    /// Every filter this client has asked for, in request order.
    held: Vec<String>,
    /// Requested but not yet handed a packet id by the transport.
    pending: VecDeque<String>,
    /// Sent, waiting for the SubAck.
    inflight: HashMap<u16, String>,
}

/// Tracks transport connectivity and owns the subscription list used to
/// restore a lost session.
///
/// The connected flag is last-writer-wins: transitions are idempotent, so a
/// single atomic is all the status surface needs to read it.
pub struct ConnectionTracker {
    connected: AtomicBool,
    transport: Arc<dyn TransportHandle>,
    registry: Arc<MetricsRegistry>,
    book: Mutex<SubscriptionBook>,
}

impl ConnectionTracker {
    pub fn new(transport: Arc<dyn TransportHandle>, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            transport,
            registry,
            book: Mutex::new(SubscriptionBook::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_connected(&self, connected: bool, event: &'static str) {
        self.connected.store(connected, Ordering::Release);
        self.registry.count_connection_event(event);
    }

    fn book(&self) -> MutexGuard<'_, SubscriptionBook> {
        // The book holds no invariants a panicking writer could break halfway.
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.book().held.clone()
    }

    /// Subscribe to a filter and remember it for later resubscription.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        {
            let mut book = self.book();
            if !book.held.iter().any(|held| held == topic) {
                book.held.push(topic.to_owned());
            }
            book.pending.push_back(topic.to_owned());
        }
        info!(topic, "subscribing");
        if let Err(e) = self.transport.subscribe(topic).await {
            self.unqueue(&[topic.to_owned()]);
            return Err(e.into());
        }
        Ok(())
    }

    /// Drop requests that never reached the transport, newest first, so the
    /// next outgoing packet id binds to the right filter.
    fn unqueue(&self, topics: &[String]) {
        let mut book = self.book();
        for topic in topics.iter().rev() {
            if let Some(pos) = book.pending.iter().rposition(|pending| pending == topic) {
                book.pending.remove(pos);
            }
        }
    }

    pub fn on_connect_success(&self) {
        info!("connection successful");
        self.set_connected(true, "connected");
    }

    pub fn on_connection_failure(&self, error: &dyn Display) {
        warn!(error = %error, "connection failed");
        self.set_connected(false, "failed");
    }

    /// Subscribes still waiting for a SubAck died with the connection; the
    /// broker will never acknowledge them.
    pub fn on_interrupted(&self, error: &dyn Display) {
        warn!(error = %error, "connection interrupted");
        self.set_connected(false, "interrupted");
        let lost = std::mem::take(&mut self.book().inflight);
        if !lost.is_empty() {
            warn!(count = lost.len(), "subscriptions lost before acknowledgement");
        }
    }

    pub fn on_closed(&self) {
        info!("connection closed");
        self.set_connected(false, "closed");
    }

    /// Connection came back. Without a persisted session the broker forgot
    /// our filters, so every held filter is requested again; the outcome
    /// arrives later through `on_subscribe_complete`.
    pub async fn on_resumed(
        &self,
        return_code: ConnectReturnCode,
        session_present: bool,
    ) -> Result<(), TransportError> {
        info!(?return_code, session_present, "connection resumed");
        self.set_connected(true, "resumed");

        if return_code != ConnectReturnCode::Success || session_present {
            return Ok(());
        }

        let topics = {
            let mut book = self.book();
            let topics = book.held.clone();
            book.pending.extend(topics.iter().cloned());
            topics
        };
        info!(count = topics.len(), "session did not persist, resubscribing to existing topics");
        for (sent, topic) in topics.iter().enumerate() {
            if let Err(e) = self.transport.subscribe(topic).await {
                self.unqueue(&topics[sent..]);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// The transport assigned a packet id to the oldest pending subscribe.
    pub fn bind_subscribe_packet(&self, pkid: u16) {
        let mut book = self.book();
        match book.pending.pop_front() {
            Some(topic) => {
                book.inflight.insert(pkid, topic);
            }
            None => warn!(pkid, "outgoing subscribe with no pending topic"),
        }
    }

    /// Handle a SubAck. A `None` grant means the broker rejected the filter,
    /// which is fatal: running on without our telemetry subscription would
    /// silently ingest nothing.
    pub fn on_subscribe_complete(
        &self,
        pkid: u16,
        granted: &[Option<QoS>],
    ) -> Result<(), TransportError> {
        let topic = self.book().inflight.remove(&pkid);
        let Some(topic) = topic else {
            warn!(pkid, "SubAck for unknown packet id");
            return Ok(());
        };

        for qos in granted {
            match qos {
                Some(qos) => info!(topic = %topic, ?qos, "subscribed"),
                None => {
                    error!(topic = %topic, "server rejected subscription");
                    return Err(TransportError::SubscriptionRejected { topic });
                }
            }
        }
        Ok(())
    }
}
