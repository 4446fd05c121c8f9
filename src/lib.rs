pub mod config;
pub mod error;
pub mod metrics;
pub mod pairs;
pub mod prober;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use error::{ProbeError, ProbeResult, SupervisorError};
pub use metrics::{LinkMetrics, PingMetrics};
pub use pairs::{BrokerPair, generate_broker_pairs};
pub use prober::{LinkProber, ProbeState, ProberSettings};
pub use supervisor::Supervisor;
