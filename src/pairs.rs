//! Directed broker pairs
//!
//! Turns the ordered broker list into every directed link that has to be probed and derives
//! the per-link identifiers. Both endpoints are base64 encoded (URL-safe alphabet, no padding)
//! before they become topic segments, so addresses containing `/`, `+` or `#` can never collide
//! with the topic structure.
//!
//! For a link `A -> B` the prober connected to `A` subscribes to `ping/A/B` and publishes to
//! `ping/B/A`. The reverse link subscribes to exactly that topic on `B`, so the two brokers
//! exchange pings over a single topic pair regardless of which side initiates.

use base64::{Engine, engine::general_purpose};

use crate::error::{ProbeError, ProbeResult};

/// Prefix shared by every ping topic
pub const TOPIC_PREFIX: &str = "ping";

/// A directed probing relationship from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerPair {
    /// Broker the prober connects to
    pub source: String,

    /// Broker whose liveness is observed through `source`
    pub destination: String,

    /// `source` encoded for use in topic segments
    pub base64_source: String,

    /// `destination` encoded for use in topic segments
    pub base64_destination: String,

    /// Session identity on the source broker, unique per running prober
    pub client_id: String,

    /// Inbound channel (`ping/<source>/<destination>`)
    pub subscription_topic: String,

    /// Outbound channel (`ping/<destination>/<source>`)
    pub publish_topic: String,
}

impl BrokerPair {
    /// Derive all identifiers for one directed link
    pub fn new(source: &str, destination: &str, client_id_prefix: &str) -> Self {
        let base64_source = encode_endpoint(source);
        let base64_destination = encode_endpoint(destination);

        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            subscription_topic: ping_topic(&base64_source, &base64_destination),
            publish_topic: ping_topic(&base64_destination, &base64_source),
            client_id: client_id(client_id_prefix, &base64_source, &base64_destination),
            base64_source,
            base64_destination,
        }
    }

    /// Human readable label used in logs
    pub fn label(&self) -> String {
        format!("{} -> {}", self.source, self.destination)
    }
}

/// Build every directed pair of the broker list
///
/// Sources are iterated in input order and, for each source, destinations in input order with
/// the source itself left out. Duplicate addresses are not rejected.
pub fn generate_broker_pairs(brokers: &[String], client_id_prefix: &str) -> ProbeResult<Vec<BrokerPair>> {
    if brokers.len() < 2 {
        return Err(ProbeError::InsufficientEndpoints(brokers.len()));
    }

    let pairs = brokers
        .iter()
        .flat_map(|source| {
            brokers
                .iter()
                .filter(move |destination| *destination != source)
                .map(move |destination| BrokerPair::new(source, destination, client_id_prefix))
        })
        .collect();

    Ok(pairs)
}

/// URL-safe, padding-free encoding of a broker address
pub fn encode_endpoint(address: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(address.as_bytes())
}

fn ping_topic(first: &str, second: &str) -> String {
    format!("{TOPIC_PREFIX}/{first}/{second}")
}

fn client_id(prefix: &str, base64_source: &str, base64_destination: &str) -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    let token = &token[..8];

    if prefix.is_empty() {
        format!("{base64_source}-{base64_destination}-{token}")
    } else {
        format!("{prefix}-{base64_source}-{base64_destination}-{token}")
    }
}
