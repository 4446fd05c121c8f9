//! LinkProber - measures liveness of one directed broker link
//!
//! ## States
//!
//! ```text
//! Connecting ─> Subscribing ─> Ready ─> Probing ─> Draining ─> Closed
//!      │              │
//!      └──────────────┴─> Failed
//! ```
//!
//! The probe loop only starts once the subscription on the inbound topic is acknowledged, so
//! an echo can never arrive before anyone listens for it.
//!
//! ## Probe loop
//!
//! Every iteration checks, without blocking, whether the link was cancelled, whether the
//! receive window (`2 × ping_interval`) expired, or whether a message arrived. Ready events are
//! picked in random order. When nothing is pending a ping is published and the prober idles for
//! one `ping_interval` before checking again.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::ProbeResult;
use crate::metrics::LinkMetrics;
use crate::pairs::BrokerPair;
use crate::transport::{ConnectOptions, ConnectionListener, Connector, Inbox, InboundMessage, QoS, Session};

/// Payload of every ping
pub const PING_PAYLOAD: &[u8] = b"ping";

/// Lifecycle of a link prober
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Connecting,
    Subscribing,
    /// Subscription acknowledged. Transient: replaced by `Probing` without yielding, so a
    /// `watch` observer normally sees `Probing` directly and should wait for that instead.
    Ready,
    /// Probe loop running; entered only after `Ready`
    Probing,
    Draining,
    Closed,
    Failed,
}

impl ProbeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProbeState::Closed | ProbeState::Failed)
    }
}

/// Timing and transport settings shared by all probers
#[derive(Debug, Clone)]
pub struct ProberSettings {
    /// Publish cadence; the receive window is twice this value
    pub ping_interval: Duration,

    /// Upper bound for unsubscribe + disconnect on teardown
    pub disconnect_grace: Duration,

    /// Quality of service for subscribe and publish
    pub qos: QoS,

    /// Options handed to the connector
    pub connect: ConnectOptions,
}

impl ProberSettings {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            ping_interval,
            disconnect_grace: Duration::from_secs(5),
            qos: QoS::AtMostOnce,
            connect: ConnectOptions::default(),
        }
    }

    /// Length of the window in which an echo must arrive
    pub fn receive_window(&self) -> Duration {
        self.ping_interval.saturating_mul(2)
    }
}

/// Deadline `window` from now, clamped far into the future instead of overflowing
fn deadline_after(window: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(window)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

enum ProbeEvent {
    Cancelled,
    Missed,
    Inbound(InboundMessage),
}

/// Drives one directed link from connect to teardown
pub struct LinkProber {
    pair: BrokerPair,
    connector: Arc<dyn Connector>,
    metrics: LinkMetrics,
    settings: ProberSettings,
    state_tx: watch::Sender<ProbeState>,
}

impl LinkProber {
    pub fn new(
        pair: BrokerPair,
        connector: Arc<dyn Connector>,
        metrics: LinkMetrics,
        settings: ProberSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProbeState::Connecting);

        Self {
            pair,
            connector,
            metrics,
            settings,
            state_tx,
        }
    }

    pub fn pair(&self) -> &BrokerPair {
        &self.pair
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<ProbeState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ProbeState) {
        trace!("state -> {state:?}");
        self.state_tx.send_replace(state);
    }

    /// Run the prober until `cancel` fires or the link fails structurally
    ///
    /// Returns `Ok(())` after a cancellation and an error if the source broker could not be
    /// connected or refused the subscription. The transport connection is released on every
    /// path.
    #[instrument(skip_all, fields(link = %self.pair.label()))]
    pub async fn run(self, cancel: CancellationToken) -> ProbeResult<()> {
        debug!("starting link prober");

        self.set_state(ProbeState::Connecting);
        let listener: Arc<dyn ConnectionListener> = Arc::new(self.metrics.clone());
        let connect = self.connector.connect(
            &self.pair.source,
            &self.pair.client_id,
            &self.settings.connect,
            listener,
        );

        let mut session = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancelled while connecting");
                self.set_state(ProbeState::Closed);
                return Ok(());
            }
            result = connect => match result {
                Ok(session) => session,
                Err(e) => {
                    error!("unable to connect to mqtt broker: {e}");
                    self.set_state(ProbeState::Failed);
                    return Err(e);
                }
            }
        };

        self.set_state(ProbeState::Subscribing);
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => None,
            result = session.subscribe(&self.pair.subscription_topic, self.settings.qos) => Some(result),
        };

        let mut inbox = match subscribed {
            None => {
                debug!("cancelled while subscribing");
                self.drain(session, false).await;
                return Ok(());
            }
            Some(Err(e)) => {
                error!("unable to subscribe to topic {}: {e}", self.pair.subscription_topic);
                self.release(session).await;
                self.set_state(ProbeState::Failed);
                return Err(e);
            }
            Some(Ok(inbox)) => inbox,
        };

        info!("subscription started to topic: {}", self.pair.subscription_topic);
        self.set_state(ProbeState::Ready);

        self.set_state(ProbeState::Probing);
        self.probe(session.as_mut(), &mut inbox, &cancel).await;

        self.drain(session, true).await;
        debug!("link prober stopped");

        Ok(())
    }

    async fn probe(&self, session: &mut dyn Session, inbox: &mut Inbox, cancel: &CancellationToken) {
        let window = self.settings.receive_window();
        let deadline = tokio::time::sleep_until(deadline_after(window));
        tokio::pin!(deadline);

        loop {
            let event = async {
                tokio::select! {
                    _ = cancel.cancelled() => ProbeEvent::Cancelled,
                    _ = &mut deadline => ProbeEvent::Missed,
                    Some(message) = inbox.recv() => ProbeEvent::Inbound(message),
                }
            }
            .now_or_never();

            match event {
                Some(ProbeEvent::Cancelled) => return,
                Some(ProbeEvent::Missed) => {
                    debug!("no ping received within {window:?}");
                    self.metrics.record_missed();
                    deadline.as_mut().reset(deadline_after(window));
                }
                Some(ProbeEvent::Inbound(message)) => {
                    if self.is_ping(&message) {
                        trace!("received ping");
                        self.metrics.record_received();
                        deadline.as_mut().reset(deadline_after(window));
                    }
                }
                None => {
                    if let Err(e) = session
                        .publish(&self.pair.publish_topic, self.settings.qos, PING_PAYLOAD)
                        .await
                    {
                        error!(
                            "ping from source {} to destination {} failed: {e}",
                            self.pair.source, self.pair.destination
                        );
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.settings.ping_interval) => {}
                    }
                }
            }
        }
    }

    fn is_ping(&self, message: &InboundMessage) -> bool {
        if message.topic != self.pair.subscription_topic {
            warn!(
                "expected to receive {:?} as topic but got: {}",
                self.pair.subscription_topic, message.topic
            );
            return false;
        }

        if message.payload != PING_PAYLOAD {
            warn!(
                "expected to receive 'ping' as payload but got: {}",
                String::from_utf8_lossy(&message.payload)
            );
            return false;
        }

        true
    }

    /// Unsubscribe (if subscribed) and disconnect, bounded by the disconnect grace
    async fn drain(&self, mut session: Box<dyn Session>, subscribed: bool) {
        self.set_state(ProbeState::Draining);

        let grace = self.settings.disconnect_grace;
        let topic = &self.pair.subscription_topic;

        let teardown = async move {
            if subscribed {
                match session.unsubscribe(topic).await {
                    Ok(()) => debug!("unsubscribed from topic: {topic}"),
                    Err(e) => warn!("unable to gracefully unsubscribe from topic {topic}: {e}"),
                }
            }
            session.disconnect(grace).await;
        };

        if tokio::time::timeout(grace, teardown).await.is_err() {
            warn!("teardown did not finish within {grace:?}, abandoning connection");
        } else {
            debug!("disconnected from mqtt broker");
        }

        self.set_state(ProbeState::Closed);
    }

    /// Disconnect without unsubscribing, used on the failure path
    async fn release(&self, session: Box<dyn Session>) {
        let grace = self.settings.disconnect_grace;
        if tokio::time::timeout(grace, session.disconnect(grace)).await.is_err() {
            warn!("disconnect did not finish within {grace:?}, abandoning connection");
        }
    }
}
