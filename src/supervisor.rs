//! Supervisor - runs every link prober plus the metrics server
//!
//! ## Lifecycle
//!
//! ```text
//! generate pairs ─> bind metrics ─> spawn server + N×(N−1) probers
//!                                          │
//!                 first stop signal or first component failure
//!                                          │
//!                 cancel all ─> wait (deadline) ─> Ok / first failure
//!                                          │
//!                 deadline exceeded or second signal ─> forced exit
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::SupervisorError;
use crate::metrics::PingMetrics;
use crate::metrics::server::MetricsServer;
use crate::pairs::{BrokerPair, generate_broker_pairs};
use crate::prober::{LinkProber, ProberSettings};
use crate::transport::Connector;

const METRICS_SERVER: &str = "metrics server";

type ComponentResult = (String, Result<(), SupervisorError>);

enum Unwind {
    Done,
    TimedOut,
    Forced(String),
}

pub struct Supervisor {
    pairs: Vec<BrokerPair>,
    connector: Arc<dyn Connector>,
    metrics: PingMetrics,
    settings: ProberSettings,
    metrics_addr: SocketAddr,
    server: Option<MetricsServer>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    /// Build the link set; fails before anything is started if fewer than two brokers are given
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        metrics: PingMetrics,
    ) -> Result<Self, SupervisorError> {
        let pairs = generate_broker_pairs(&config.brokers, &config.client_id_prefix)?;

        Ok(Self {
            pairs,
            connector,
            metrics,
            settings: ProberSettings::new(config.ping_interval()),
            metrics_addr: config.metrics_addr(),
            server: None,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Replace the prober timing, e.g. for sub-second intervals
    pub fn with_prober_settings(mut self, settings: ProberSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Links that will be probed, in generation order
    pub fn links(&self) -> &[BrokerPair] {
        &self.pairs
    }

    /// Bind the metrics listener ahead of `run` and return its address
    pub async fn bind_metrics(&mut self) -> Result<SocketAddr, SupervisorError> {
        if let Some(server) = &self.server {
            return server
                .local_addr()
                .map_err(|e| SupervisorError::MetricsServer(e.to_string()));
        }

        let server = MetricsServer::bind(self.metrics_addr, self.metrics.clone())
            .await
            .map_err(|e| {
                SupervisorError::MetricsServer(format!("unable to bind {}: {e}", self.metrics_addr))
            })?;
        let addr = server
            .local_addr()
            .map_err(|e| SupervisorError::MetricsServer(e.to_string()))?;

        self.server = Some(server);
        Ok(addr)
    }

    /// Run until a stop signal arrives or a component fails, then shut everything down
    ///
    /// Returns the failure that triggered the shutdown, if any. `ShutdownTimeout` and
    /// `ForcedShutdown` mean the unwind was abandoned and the caller must exit immediately.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut stop: mpsc::Receiver<String>) -> Result<(), SupervisorError> {
        self.bind_metrics().await?;
        let Some(server) = self.server.take() else {
            return Err(SupervisorError::MetricsServer("listener not bound".to_string()));
        };

        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<ComponentResult> = JoinSet::new();

        let token = cancel.clone();
        tasks.spawn(async move {
            let result = server
                .serve(token)
                .await
                .map_err(|e| SupervisorError::MetricsServer(e.to_string()));
            (METRICS_SERVER.to_string(), result)
        });

        for pair in self.pairs {
            debug!(
                "link {}: subscribe {} publish {} client id {}",
                pair.label(),
                pair.subscription_topic,
                pair.publish_topic,
                pair.client_id
            );

            let link_metrics = self.metrics.link(&pair.source, &pair.destination);
            let prober = LinkProber::new(pair, self.connector.clone(), link_metrics, self.settings.clone());
            let token = cancel.child_token();

            tasks.spawn(async move {
                let link = prober.pair().label();
                let result = prober
                    .run(token)
                    .await
                    .map_err(|source| SupervisorError::LinkFailed {
                        link: link.clone(),
                        source,
                    });
                (link, result)
            });
        }

        info!("started {} link probers", tasks.len() - 1);

        let mut signals_open = true;
        let mut failure: Option<SupervisorError> = None;

        let reason = loop {
            tokio::select! {
                signal = stop.recv(), if signals_open => match signal {
                    Some(signal) => break format!("signal ({signal})"),
                    None => {
                        warn!("stop signal channel closed");
                        signals_open = false;
                    }
                },
                Some(joined) = tasks.join_next() => match flatten(joined) {
                    (name, Ok(())) => debug!("{name} stopped"),
                    (name, Err(e)) => {
                        error!("{name} failed: {e}");
                        failure = Some(e);
                        break format!("failure of {name}");
                    }
                },
                else => break "all components stopped".to_string(),
            }
        };

        info!("server shutdown initiated by: {reason}");
        cancel.cancel();

        let deadline = self.shutdown_timeout;
        let unwind = async {
            while let Some(joined) = tasks.join_next().await {
                match flatten(joined) {
                    (name, Ok(())) => debug!("{name} stopped"),
                    (name, Err(e)) => {
                        error!("{name} failed during shutdown: {e}");
                        failure.get_or_insert(e);
                    }
                }
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(deadline, unwind) => match result {
                Ok(()) => Unwind::Done,
                Err(_) => Unwind::TimedOut,
            },
            Some(signal) = stop.recv(), if signals_open => Unwind::Forced(signal),
        };

        match outcome {
            Unwind::Done => {
                info!("all components stopped");
                failure.map_or(Ok(()), Err)
            }
            Unwind::TimedOut => {
                let pending = tasks.len();
                error!("{pending} component(s) did not stop within {deadline:?}");
                tasks.abort_all();
                Err(SupervisorError::ShutdownTimeout { deadline, pending })
            }
            Unwind::Forced(signal) => {
                error!("forcefully stopped the application by signal ({signal})");
                tasks.abort_all();
                Err(SupervisorError::ForcedShutdown)
            }
        }
    }
}

fn flatten(joined: Result<ComponentResult, tokio::task::JoinError>) -> ComponentResult {
    match joined {
        Ok(result) => result,
        Err(e) => ("component".to_string(), Err(SupervisorError::Panicked(e.to_string()))),
    }
}
