//! Per-link counters and gauges
//!
//! [`PingMetrics`] owns a Prometheus registry that is constructed once by the supervisor and
//! handed to every prober. Each prober resolves its own label set into a [`LinkMetrics`] handle
//! at creation, which also registers all series at zero so an absent link can be told apart from
//! a link that simply has not received anything yet.
//!
//! All handles are backed by atomics and can be updated concurrently from any task.

pub mod server;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

use crate::transport::ConnectionListener;

pub const RECEIVED_PING: &str = "mqtt_total_received_ping";
pub const FAILED_PING: &str = "mqtt_total_failed_ping";
pub const CONNECTION_STATE: &str = "mqtt_client_connection_state";
pub const CURRENT_RECONNECT_ATTEMPTS: &str = "mqtt_client_current_reconnect_attempts";
pub const TOTAL_RECONNECT_ATTEMPTS: &str = "mqtt_client_total_reconnect_attempts";

const LABELS: &[&str] = &["source", "destination"];

/// Registry shared by all probers and the metrics server
#[derive(Clone)]
pub struct PingMetrics {
    registry: Registry,
    received_ping: IntCounterVec,
    failed_ping: IntCounterVec,
    connection_state: IntGaugeVec,
    current_reconnect_attempts: IntGaugeVec,
    total_reconnect_attempts: IntCounterVec,
}

impl PingMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let received_ping = IntCounterVec::new(
            Opts::new(RECEIVED_PING, "Total number of successful ping"),
            LABELS,
        )?;
        let failed_ping = IntCounterVec::new(
            Opts::new(FAILED_PING, "Total number of failed ping"),
            LABELS,
        )?;
        let connection_state = IntGaugeVec::new(
            Opts::new(CONNECTION_STATE, "Connection state of the MQTT client"),
            LABELS,
        )?;
        let current_reconnect_attempts = IntGaugeVec::new(
            Opts::new(
                CURRENT_RECONNECT_ATTEMPTS,
                "Current number of reconnect attempts by the MQTT client",
            ),
            LABELS,
        )?;
        let total_reconnect_attempts = IntCounterVec::new(
            Opts::new(
                TOTAL_RECONNECT_ATTEMPTS,
                "Total number of reconnect attempts by the MQTT client",
            ),
            LABELS,
        )?;

        registry.register(Box::new(received_ping.clone()))?;
        registry.register(Box::new(failed_ping.clone()))?;
        registry.register(Box::new(connection_state.clone()))?;
        registry.register(Box::new(current_reconnect_attempts.clone()))?;
        registry.register(Box::new(total_reconnect_attempts.clone()))?;

        Ok(Self {
            registry,
            received_ping,
            failed_ping,
            connection_state,
            current_reconnect_attempts,
            total_reconnect_attempts,
        })
    }

    /// Resolve (and register at zero) every series of one directed link
    pub fn link(&self, source: &str, destination: &str) -> LinkMetrics {
        let labels = [source, destination];

        let metrics = LinkMetrics {
            label: format!("{source} -> {destination}"),
            received_ping: self.received_ping.with_label_values(&labels),
            failed_ping: self.failed_ping.with_label_values(&labels),
            connection_state: self.connection_state.with_label_values(&labels),
            current_reconnect_attempts: self.current_reconnect_attempts.with_label_values(&labels),
            total_reconnect_attempts: self.total_reconnect_attempts.with_label_values(&labels),
        };

        metrics.received_ping.inc_by(0);
        metrics.failed_ping.inc_by(0);
        metrics.connection_state.set(0);
        metrics.current_reconnect_attempts.set(0);
        metrics.total_reconnect_attempts.inc_by(0);

        metrics
    }

    /// Render the registry in the plaintext exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn received_ping(&self, source: &str, destination: &str) -> u64 {
        self.received_ping.with_label_values(&[source, destination]).get()
    }

    pub fn failed_ping(&self, source: &str, destination: &str) -> u64 {
        self.failed_ping.with_label_values(&[source, destination]).get()
    }

    pub fn connection_state(&self, source: &str, destination: &str) -> i64 {
        self.connection_state.with_label_values(&[source, destination]).get()
    }

    pub fn current_reconnect_attempts(&self, source: &str, destination: &str) -> i64 {
        self.current_reconnect_attempts
            .with_label_values(&[source, destination])
            .get()
    }

    pub fn total_reconnect_attempts(&self, source: &str, destination: &str) -> u64 {
        self.total_reconnect_attempts
            .with_label_values(&[source, destination])
            .get()
    }
}

/// Pre-resolved series of a single link
#[derive(Clone)]
pub struct LinkMetrics {
    label: String,
    received_ping: IntCounter,
    failed_ping: IntCounter,
    connection_state: IntGauge,
    current_reconnect_attempts: IntGauge,
    total_reconnect_attempts: IntCounter,
}

impl LinkMetrics {
    pub fn record_received(&self) {
        self.received_ping.inc();
    }

    pub fn record_missed(&self) {
        self.failed_ping.inc();
    }

    pub fn received(&self) -> u64 {
        self.received_ping.get()
    }

    pub fn missed(&self) -> u64 {
        self.failed_ping.get()
    }
}

impl ConnectionListener for LinkMetrics {
    fn on_connected(&self) {
        debug!("{}: connected to mqtt broker", self.label);
        self.connection_state.set(1);
        self.current_reconnect_attempts.set(0);
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!("{}: connection lost to mqtt broker: {reason}", self.label);
        self.connection_state.set(0);
    }

    fn on_reconnecting(&self) {
        self.current_reconnect_attempts.inc();
        self.total_reconnect_attempts.inc();
        warn!(
            "{}: reconnecting to mqtt broker, attempt: {}",
            self.label,
            self.current_reconnect_attempts.get()
        );
    }

    fn on_disconnected(&self) {
        self.connection_state.set(0);
    }
}
