//! Error types for link probing and supervision

use std::fmt;
use std::time::Duration;

/// Result type alias for probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors that can occur while building or driving a single link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Fewer than two brokers were supplied
    InsufficientEndpoints(usize),

    /// A broker address could not be turned into host and port
    InvalidAddress(String),

    /// The transport connection could not be established
    Connect(String),

    /// The broker did not acknowledge the connection in time
    ConnectTimeout(Duration),

    /// The broker answered the subscription with a failure code
    SubscriptionRefused(String),

    /// The subscription request itself failed (no acknowledgement, channel closed, ...)
    Subscribe(String),

    /// Publishing a ping failed
    Publish(String),

    /// Unsubscribing during teardown failed
    Unsubscribe(String),

    /// The connection was already torn down
    Closed,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::InsufficientEndpoints(count) => write!(
                f,
                "received {count} item(s) in list but at least 2 are required"
            ),
            ProbeError::InvalidAddress(address) => {
                write!(f, "invalid broker address: {address}")
            }
            ProbeError::Connect(msg) => write!(f, "unable to connect to mqtt broker: {msg}"),
            ProbeError::ConnectTimeout(timeout) => {
                write!(f, "mqtt broker did not acknowledge connection within {timeout:?}")
            }
            ProbeError::SubscriptionRefused(topic) => {
                write!(f, "subscription not allowed to topic {topic}")
            }
            ProbeError::Subscribe(msg) => write!(f, "unable to subscribe: {msg}"),
            ProbeError::Publish(msg) => write!(f, "unable to publish ping: {msg}"),
            ProbeError::Unsubscribe(msg) => write!(f, "unable to unsubscribe: {msg}"),
            ProbeError::Closed => write!(f, "connection already closed"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Errors surfaced by the supervisor to the process boundary
#[derive(Debug)]
pub enum SupervisorError {
    /// Startup configuration is unusable; nothing was started
    Configuration(ProbeError),

    /// A link could not connect or subscribe, which triggered shutdown
    LinkFailed { link: String, source: ProbeError },

    /// The metrics exposition process failed to start or stopped with an error
    MetricsServer(String),

    /// Components did not unwind before the shutdown deadline
    ShutdownTimeout { deadline: Duration, pending: usize },

    /// A second stop signal arrived while shutting down
    ForcedShutdown,

    /// A component task panicked
    Panicked(String),
}

impl SupervisorError {
    /// Whether the process must exit right away instead of returning normally
    pub fn is_forced(&self) -> bool {
        matches!(
            self,
            SupervisorError::ShutdownTimeout { .. } | SupervisorError::ForcedShutdown
        )
    }
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Configuration(err) => write!(f, "invalid configuration: {err}"),
            SupervisorError::LinkFailed { link, source } => {
                write!(f, "link {link} failed: {source}")
            }
            SupervisorError::MetricsServer(msg) => write!(f, "metrics server failed: {msg}"),
            SupervisorError::ShutdownTimeout { deadline, pending } => write!(
                f,
                "{pending} component(s) did not stop within {deadline:?}"
            ),
            SupervisorError::ForcedShutdown => write!(f, "forcefully stopped the application"),
            SupervisorError::Panicked(msg) => write!(f, "component panicked: {msg}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Configuration(err) => Some(err),
            SupervisorError::LinkFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ProbeError> for SupervisorError {
    fn from(err: ProbeError) -> Self {
        SupervisorError::Configuration(err)
    }
}
