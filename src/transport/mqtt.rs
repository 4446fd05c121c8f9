//! MQTT transport backed by rumqttc
//!
//! ## Message Flow
//!
//! ```text
//! MqttSession ── requests ──> AsyncClient ──> EventLoop (driver task) ──> broker
//!      ↑                                            │
//!      ├──── acks (SubAck / UnsubAck) ──────────────┤
//!      └──── Inbox (Publish, routed by topic) ──────┘
//! ```
//!
//! The initial connect is polled inline so a refusal or a timeout is returned to the caller.
//! Afterwards a driver task owns the event loop: rumqttc reconnects on the next poll after an
//! error, the driver only reports loss/reconnect/success to the [`ConnectionListener`] and
//! re-issues subscriptions when the broker did not keep the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ConnectOptions, ConnectionListener, Connector, Inbox, InboundMessage, Session};
use crate::error::{ProbeError, ProbeResult};

const DEFAULT_PORT: u16 = 1883;

/// Capacity of rumqttc's request channel
const REQUEST_CAPACITY: usize = 16;

/// Pause between reconnect attempts of the event loop
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Acknowledgements nobody waits for are dropped once this many are queued
const ACK_CAPACITY: usize = 8;

type Routes = Arc<Mutex<HashMap<String, Route>>>;

struct Route {
    qos: QoS,
    sender: mpsc::Sender<InboundMessage>,
}

#[derive(Debug)]
enum Ack {
    Subscribe(SubAck),
    Unsubscribe,
}

/// Dials MQTT brokers given as `host:port` (optionally prefixed with `tcp://` or `mqtt://`)
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        address: &str,
        client_id: &str,
        options: &ConnectOptions,
        listener: Arc<dyn ConnectionListener>,
    ) -> ProbeResult<Box<dyn Session>> {
        let (host, port) = parse_address(address)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_clean_session(options.clean_session)
            .set_keep_alive(options.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let ack = tokio::time::timeout(options.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| ProbeError::ConnectTimeout(options.connect_timeout))??;

        debug!("connected to {address} as {client_id} (session present: {})", ack.session_present);
        listener.on_connected();

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CAPACITY);
        let stop = CancellationToken::new();

        let driver = Driver {
            eventloop,
            client: client.clone(),
            listener: listener.clone(),
            routes: routes.clone(),
            ack_tx,
            stop: stop.clone(),
        };
        let driver = tokio::spawn(driver.run());

        Ok(Box::new(MqttSession {
            client,
            routes,
            acks: ack_rx,
            options: options.clone(),
            listener,
            stop,
            driver,
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> ProbeResult<ConnAck> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(ack)
                } else {
                    Err(ProbeError::Connect(format!("broker returned {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(ProbeError::Connect(e.to_string())),
        }
    }
}

/// Split a broker address into host and port
pub fn parse_address(address: &str) -> ProbeResult<(String, u16)> {
    let stripped = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address);

    let (host, port) = match stripped.rsplit_once(':') {
        // bare IPv6 literal without port
        Some((host, _)) if host.contains(':') && !host.ends_with(']') => (stripped, DEFAULT_PORT),
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProbeError::InvalidAddress(address.to_string()))?;
            (host, port)
        }
        None => (stripped, DEFAULT_PORT),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProbeError::InvalidAddress(address.to_string()));
    }

    Ok((host.to_string(), port))
}

/// Owns the event loop for the lifetime of a session
struct Driver {
    eventloop: EventLoop,
    client: AsyncClient,
    listener: Arc<dyn ConnectionListener>,
    routes: Routes,
    ack_tx: mpsc::Sender<Ack>,
    stop: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let mut connected = true;

        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => route(&self.routes, publish).await,
                Ok(Event::Incoming(Packet::SubAck(ack))) => self.forward(Ack::Subscribe(ack)),
                Ok(Event::Incoming(Packet::UnsubAck(_))) => self.forward(Ack::Unsubscribe),
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    connected = true;
                    self.listener.on_connected();
                    if !ack.session_present {
                        resubscribe(&self.routes, &self.client).await;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    trace!("disconnect sent, stopping event loop");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if connected {
                        connected = false;
                        self.listener.on_connection_lost(&e.to_string());
                    }
                    self.listener.on_reconnecting();

                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    fn forward(&self, ack: Ack) {
        if let Err(mpsc::error::TrySendError::Full(ack)) = self.ack_tx.try_send(ack) {
            trace!("no one waiting, dropping {ack:?}");
        }
    }
}

async fn route(routes: &Routes, publish: Publish) {
    let routes = routes.lock().await;
    let Some(route) = routes.get(&publish.topic) else {
        debug!("dropping message on unsubscribed topic {}", publish.topic);
        return;
    };

    let message = InboundMessage {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
    };

    if let Err(mpsc::error::TrySendError::Full(message)) = route.sender.try_send(message) {
        warn!("inbox full, dropping message on {}", message.topic);
    }
}

async fn resubscribe(routes: &Routes, client: &AsyncClient) {
    let routes = routes.lock().await;
    for (topic, route) in routes.iter() {
        debug!("session not present, re-subscribing to {topic}");
        if let Err(e) = client.try_subscribe(topic.clone(), route.qos) {
            warn!("unable to re-subscribe to {topic}: {e}");
        }
    }
}

/// A live MQTT connection
pub struct MqttSession {
    client: AsyncClient,
    routes: Routes,
    acks: mpsc::Receiver<Ack>,
    options: ConnectOptions,
    listener: Arc<dyn ConnectionListener>,
    stop: CancellationToken,
    driver: JoinHandle<()>,
}

impl MqttSession {
    /// Drop acknowledgements of requests nobody waited for, e.g. re-subscriptions
    fn discard_stale_acks(&mut self) {
        while let Ok(ack) = self.acks.try_recv() {
            trace!("discarding stale {ack:?}");
        }
    }

    async fn wait_for_suback(&mut self) -> ProbeResult<SubAck> {
        loop {
            match self.acks.recv().await {
                Some(Ack::Subscribe(ack)) => return Ok(ack),
                Some(Ack::Unsubscribe) => continue,
                None => return Err(ProbeError::Closed),
            }
        }
    }

    async fn wait_for_unsuback(&mut self) -> ProbeResult<()> {
        loop {
            match self.acks.recv().await {
                Some(Ack::Unsubscribe) => return Ok(()),
                Some(Ack::Subscribe(_)) => continue,
                None => return Err(ProbeError::Closed),
            }
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> ProbeResult<Inbox> {
        let (sender, inbox) = mpsc::channel(self.options.inbox_capacity);
        self.routes
            .lock()
            .await
            .insert(topic.to_string(), Route { qos, sender });

        self.discard_stale_acks();
        self.client
            .subscribe(topic, qos)
            .await
            .map_err(|e| ProbeError::Subscribe(e.to_string()))?;

        let timeout = self.options.ack_timeout;
        let ack = tokio::time::timeout(timeout, self.wait_for_suback())
            .await
            .map_err(|_| ProbeError::Subscribe(format!("no acknowledgement within {timeout:?}")))??;

        if ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            self.routes.lock().await.remove(topic);
            return Err(ProbeError::SubscriptionRefused(topic.to_string()));
        }

        Ok(inbox)
    }

    async fn publish(&mut self, topic: &str, qos: QoS, payload: &[u8]) -> ProbeResult<()> {
        self.client
            .try_publish(topic, qos, false, payload.to_vec())
            .map_err(|e| ProbeError::Publish(e.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> ProbeResult<()> {
        self.routes.lock().await.remove(topic);

        self.discard_stale_acks();
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| ProbeError::Unsubscribe(e.to_string()))?;

        let timeout = self.options.ack_timeout;
        tokio::time::timeout(timeout, self.wait_for_unsuback())
            .await
            .map_err(|_| ProbeError::Unsubscribe(format!("no acknowledgement within {timeout:?}")))?
    }

    async fn disconnect(mut self: Box<Self>, grace: Duration) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("unable to request disconnect: {e}");
        }

        if tokio::time::timeout(grace, &mut self.driver).await.is_err() {
            warn!("event loop did not stop within {grace:?}, aborting it");
            self.driver.abort();
        }

        self.listener.on_disconnected();
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
