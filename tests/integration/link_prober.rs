//! Link prober lifecycle tests
//!
//! These tests verify a single prober against the fake cluster:
//! - Subscription is acknowledged before the first ping goes out
//! - Echoes are counted and silence is detected per receive window
//! - Unexpected payloads are ignored
//! - Cancellation from every phase releases the connection
//! - Structural failures end the prober with an error

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use mqtt_pinger::{
    BrokerPair, LinkProber, PingMetrics, ProbeError, ProbeState, ProberSettings,
    prober::PING_PAYLOAD,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

const SOURCE: &str = "tcp://10.0.0.1:1883";
const DESTINATION: &str = "tcp://10.0.0.2:1883";

struct Running {
    pair: BrokerPair,
    metrics: PingMetrics,
    state: watch::Receiver<ProbeState>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), ProbeError>>,
}

fn settings(interval_ms: u64) -> ProberSettings {
    let mut settings = ProberSettings::new(Duration::from_millis(interval_ms));
    settings.disconnect_grace = Duration::from_millis(500);
    settings
}

fn start(cluster: &FakeCluster, settings: ProberSettings) -> Running {
    let pair = BrokerPair::new(SOURCE, DESTINATION, "test");
    let metrics = PingMetrics::new().unwrap();
    let link = metrics.link(SOURCE, DESTINATION);

    let prober = LinkProber::new(pair.clone(), Arc::new(cluster.clone()), link, settings);
    let state = prober.state();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(prober.run(cancel.clone()));

    Running {
        pair,
        metrics,
        state,
        cancel,
        handle,
    }
}

async fn wait_for(state: &mut watch::Receiver<ProbeState>, expected: ProbeState) {
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == expected))
        .await
        .expect("state not reached in time")
        .unwrap();
}

async fn stop(running: Running) -> Result<(), ProbeError> {
    running.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), running.handle)
        .await
        .expect("prober did not stop in time")
        .unwrap()
}

#[tokio::test]
async fn test_subscription_acknowledged_before_first_ping() {
    let cluster = FakeCluster::reflecting().with_behavior(
        SOURCE,
        BrokerBehavior {
            subscribe_delay: Duration::from_millis(150),
            ..Default::default()
        },
    );
    let mut running = start(&cluster, settings(50));

    wait_for(&mut running.state, ProbeState::Probing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = cluster.events();
    let subscribed = events
        .iter()
        .position(|e| matches!(e, Event::Subscribed { .. }))
        .unwrap();
    let first_publish = events
        .iter()
        .position(|e| matches!(e, Event::Published { .. }))
        .unwrap();
    assert!(subscribed < first_publish);

    assert_matches!(
        &events[0],
        Event::Connected { broker, client_id } if broker == SOURCE && *client_id == running.pair.client_id
    );
    assert_matches!(
        &events[subscribed],
        Event::Subscribed { broker, topic } if broker == SOURCE && *topic == running.pair.subscription_topic
    );

    assert_matches!(
        &events[first_publish],
        Event::Published { broker, topic } if broker == SOURCE && *topic == running.pair.publish_topic
    );

    stop(running).await.unwrap();
}

#[tokio::test]
async fn test_echoed_pings_are_counted() {
    let cluster = FakeCluster::reflecting();
    let running = start(&cluster, settings(50));

    tokio::time::sleep(Duration::from_millis(600)).await;

    let received = running.metrics.received_ping(SOURCE, DESTINATION);
    let failed = running.metrics.failed_ping(SOURCE, DESTINATION);
    assert!(received > 4, "received only {received} pings");
    assert!(failed <= 1, "{failed} windows missed on a healthy link");
    assert_eq!(running.metrics.connection_state(SOURCE, DESTINATION), 1);

    let metrics = running.metrics.clone();
    stop(running).await.unwrap();
    assert_eq!(metrics.connection_state(SOURCE, DESTINATION), 0);
}

#[tokio::test]
async fn test_silent_link_counts_missed_windows() {
    let cluster = FakeCluster::reflecting().with_behavior(
        SOURCE,
        BrokerBehavior {
            silent: true,
            ..Default::default()
        },
    );
    let running = start(&cluster, settings(50));

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let failed = running.metrics.failed_ping(SOURCE, DESTINATION);
    assert_eq!(running.metrics.received_ping(SOURCE, DESTINATION), 0);
    assert!((4..=11).contains(&failed), "unexpected number of missed windows: {failed}");
    assert!(cluster.published(SOURCE) > 5);

    stop(running).await.unwrap();
}

#[tokio::test]
async fn test_unexpected_payload_is_ignored() {
    let cluster = FakeCluster::new();
    let mut running = start(&cluster, settings(50));
    wait_for(&mut running.state, ProbeState::Probing).await;

    cluster.inject(&running.pair.subscription_topic, b"pong");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(running.metrics.received_ping(SOURCE, DESTINATION), 0);

    cluster.inject(&running.pair.subscription_topic, PING_PAYLOAD);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(running.metrics.received_ping(SOURCE, DESTINATION), 1);

    stop(running).await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let cluster = FakeCluster::new().with_behavior(
        SOURCE,
        BrokerBehavior {
            connect_delay: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let running = start(&cluster, settings(50));
    let mut state = running.state.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    stop(running).await.unwrap();

    wait_for(&mut state, ProbeState::Closed).await;
    assert!(cluster.events().is_empty());
}

#[tokio::test]
async fn test_cancel_while_subscribing() {
    let cluster = FakeCluster::new().with_behavior(
        SOURCE,
        BrokerBehavior {
            subscribe_delay: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let mut running = start(&cluster, settings(50));
    wait_for(&mut running.state, ProbeState::Subscribing).await;
    let mut state = running.state.clone();

    stop(running).await.unwrap();

    wait_for(&mut state, ProbeState::Closed).await;
    assert_eq!(cluster.disconnected(), 1);
    assert_eq!(cluster.count(|e| matches!(e, Event::Unsubscribed { .. })), 0);
}

#[tokio::test]
async fn test_cancel_while_probing_unsubscribes_then_disconnects() {
    let cluster = FakeCluster::reflecting();
    let mut running = start(&cluster, settings(50));
    wait_for(&mut running.state, ProbeState::Probing).await;
    let mut state = running.state.clone();
    let pair = running.pair.clone();

    stop(running).await.unwrap();

    wait_for(&mut state, ProbeState::Closed).await;
    let events = cluster.events();
    let unsubscribed = events
        .iter()
        .position(|e| matches!(e, Event::Unsubscribed { .. }))
        .unwrap();
    assert_matches!(
        &events[unsubscribed],
        Event::Unsubscribed { broker, topic } if broker == SOURCE && *topic == pair.subscription_topic
    );
    assert_matches!(
        events.last(),
        Some(Event::Disconnected { broker, client_id }) if broker == SOURCE && *client_id == pair.client_id
    );
    assert!(unsubscribed < events.len() - 1);
    assert_eq!(cluster.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_cancel_during_idle_returns_promptly() {
    let cluster = FakeCluster::reflecting();
    let mut running = start(&cluster, settings(10_000));
    wait_for(&mut running.state, ProbeState::Probing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    stop(running).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_maximal_interval_publishes_once_and_cancels() {
    let cluster = FakeCluster::reflecting();
    let mut running = start(&cluster, ProberSettings::new(Duration::MAX));
    wait_for(&mut running.state, ProbeState::Probing).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(cluster.published(SOURCE), 1);
    assert_eq!(running.metrics.failed_ping(SOURCE, DESTINATION), 0);

    stop(running).await.unwrap();
}

#[tokio::test]
async fn test_hung_disconnect_is_bounded_by_grace() {
    let cluster = FakeCluster::reflecting().with_behavior(
        SOURCE,
        BrokerBehavior {
            disconnect_delay: Duration::from_secs(30),
            ..Default::default()
        },
    );
    let mut running = start(&cluster, settings(50));
    wait_for(&mut running.state, ProbeState::Probing).await;

    let started = tokio::time::Instant::now();
    stop(running).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_connect_refusal_fails_the_link() {
    let cluster = FakeCluster::new().with_behavior(
        SOURCE,
        BrokerBehavior {
            refuse_connect: true,
            ..Default::default()
        },
    );
    let running = start(&cluster, settings(50));
    let state = running.state.clone();

    let result = tokio::time::timeout(Duration::from_secs(2), running.handle)
        .await
        .unwrap()
        .unwrap();

    assert_matches!(result, Err(ProbeError::Connect(_)));
    assert_eq!(*state.borrow(), ProbeState::Failed);
}

#[tokio::test]
async fn test_subscription_refusal_fails_the_link() {
    let cluster = FakeCluster::new().with_behavior(
        SOURCE,
        BrokerBehavior {
            refuse_subscribe: true,
            ..Default::default()
        },
    );
    let running = start(&cluster, settings(50));
    let state = running.state.clone();
    let topic = running.pair.subscription_topic.clone();

    let result = tokio::time::timeout(Duration::from_secs(2), running.handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result, Err(ProbeError::SubscriptionRefused(topic)));
    assert_eq!(*state.borrow(), ProbeState::Failed);
    assert_eq!(cluster.disconnected(), 1);
    assert_eq!(cluster.published(SOURCE), 0);
}
