//! Messaging client capability consumed by the probers
//!
//! A [`Connector`] dials a broker and hands back a [`Session`] that owns the transport
//! connection exclusively. Sessions subscribe, publish, unsubscribe and finally disconnect.
//! Connection-state changes that happen after the initial connect (loss, reconnect attempts,
//! successful reconnects) are reported through a [`ConnectionListener`]; the transport owns the
//! reconnection policy, callers only observe it.

pub mod mqtt;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProbeResult;

pub use rumqttc::QoS;

/// Options applied when opening a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// How long to wait for the broker to acknowledge the connection
    pub connect_timeout: Duration,

    /// How long to wait for subscribe/unsubscribe acknowledgements
    pub ack_timeout: Duration,

    /// Persistent session (`false`) or clean session (`true`)
    pub clean_session: bool,

    /// Protocol keep-alive; `Duration::ZERO` disables it
    pub keep_alive: Duration,

    /// Capacity of the inbound message queue
    pub inbox_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(5),
            clean_session: false,
            keep_alive: Duration::ZERO,
            inbox_capacity: 64,
        }
    }
}

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Queue of messages delivered on a session's subscriptions
pub type Inbox = mpsc::Receiver<InboundMessage>;

/// Observer for connection-state transitions after the initial connect
pub trait ConnectionListener: Send + Sync {
    /// The connection was (re-)established
    fn on_connected(&self);

    /// An established connection was lost unexpectedly
    fn on_connection_lost(&self, reason: &str);

    /// The transport is attempting to reconnect
    fn on_reconnecting(&self);

    /// The connection was closed on request
    fn on_disconnected(&self);
}

/// Dials brokers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `address` under the session identity `client_id`
    ///
    /// Fails when the broker refuses or does not acknowledge the connection within
    /// `options.connect_timeout`. No retry is attempted here.
    async fn connect(
        &self,
        address: &str,
        client_id: &str,
        options: &ConnectOptions,
        listener: Arc<dyn ConnectionListener>,
    ) -> ProbeResult<Box<dyn Session>>;
}

/// An established connection owned by exactly one prober
#[async_trait]
pub trait Session: Send {
    /// Subscribe and wait for the broker's acknowledgement
    ///
    /// A refusal code in the acknowledgement yields `ProbeError::SubscriptionRefused`.
    /// The returned inbox receives every message delivered on the session.
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> ProbeResult<Inbox>;

    /// Queue a message for publishing without waiting for the network
    async fn publish(&mut self, topic: &str, qos: QoS, payload: &[u8]) -> ProbeResult<()>;

    /// Unsubscribe and wait for the broker's acknowledgement
    async fn unsubscribe(&mut self, topic: &str) -> ProbeResult<()>;

    /// Close the connection, waiting at most `grace` for an orderly close
    async fn disconnect(self: Box<Self>, grace: Duration);
}
