use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::trace;

const DEFAULT_METRICS_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0));

const DEFAULT_METRICS_PORT: u16 = 8081;

const DEFAULT_PING_INTERVAL: u64 = 10;

const DEFAULT_CLIENT_ID_PREFIX: &str = "mqtt-pinger";

const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 15;

/// One day
const MAX_PING_INTERVAL: u64 = 86_400;

/// One hour
const MAX_SHUTDOWN_TIMEOUT: u64 = 3_600;

/// Command line arguments; every flag can also be given through the environment
#[derive(Debug, Clone, Parser)]
#[command(name = "mqtt-pinger", version, about)]
pub struct Args {
    /// JSON config file, flags take precedence over its values
    #[arg(short = 'f', long = "config")]
    pub file: Option<PathBuf>,

    /// The brokers to send pings between
    #[arg(long, env = "BROKERS", value_delimiter = ',', num_args = 1..)]
    pub brokers: Vec<String>,

    /// The address to use for the metrics http listener
    #[arg(long, env = "METRICS_ADDRESS")]
    pub metrics_address: Option<IpAddr>,

    /// The metrics port to use for the http listener
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Seconds to idle after publishing a ping
    #[arg(long, env = "PING_INTERVAL")]
    pub ping_interval: Option<u64>,

    /// Prefix of the MQTT client ids
    #[arg(long, env = "CLIENT_ID_PREFIX")]
    pub client_id_prefix: Option<String>,

    /// Seconds to wait for all links to stop before exiting forcefully
    #[arg(long, env = "SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub brokers: Vec<String>,

    #[serde(default = "default_metrics_address")]
    pub metrics_address: IpAddr,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            brokers: vec![],
            metrics_address: default_metrics_address(),
            metrics_port: default_metrics_port(),
            ping_interval: default_ping_interval(),
            client_id_prefix: default_client_id_prefix(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_metrics_address() -> IpAddr {
    DEFAULT_METRICS_ADDRESS
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL
}

fn default_client_id_prefix() -> String {
    DEFAULT_CLIENT_ID_PREFIX.to_string()
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT
}

impl Config {
    /// Merge the optional config file with the command line
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.file {
            Some(path) => read_config_file(path)?,
            None => Config::default(),
        };

        if !args.brokers.is_empty() {
            config.brokers = args.brokers.clone();
        }
        if let Some(address) = args.metrics_address {
            config.metrics_address = address;
        }
        if let Some(port) = args.metrics_port {
            config.metrics_port = port;
        }
        if let Some(interval) = args.ping_interval {
            config.ping_interval = interval;
        }
        if let Some(prefix) = &args.client_id_prefix {
            config.client_id_prefix = prefix.clone();
        }
        if let Some(timeout) = args.shutdown_timeout {
            config.shutdown_timeout = timeout;
        }

        config.validate()?;
        trace!("loaded config: {config:?}");

        Ok(config)
    }

    /// Reject settings that would make the probe loop or the shutdown meaningless
    ///
    /// The broker count is checked when the links are generated.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_PING_INTERVAL).contains(&self.ping_interval) {
            anyhow::bail!(
                "ping interval must be between 1 and {MAX_PING_INTERVAL} seconds, got {}",
                self.ping_interval
            );
        }
        if !(1..=MAX_SHUTDOWN_TIMEOUT).contains(&self.shutdown_timeout) {
            anyhow::bail!(
                "shutdown timeout must be between 1 and {MAX_SHUTDOWN_TIMEOUT} seconds, got {}",
                self.shutdown_timeout
            );
        }
        Ok(())
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.metrics_address, self.metrics_port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

pub fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("read config file: {config:?}"))
}
