use std::sync::Arc;

use clap::Parser;
use mqtt_pinger::{
    PingMetrics, Supervisor,
    config::{Args, Config},
    shutdown::spawn_signal_listener,
    transport::mqtt::MqttConnector,
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("mqtt_pinger", level),
        ("pinger", level),
        ("tower_http", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = Config::from_args(&args)?;
    info!(
        "starting mqtt pinger for {} broker(s) with an interval of {}s",
        config.brokers.len(),
        config.ping_interval
    );

    let metrics = PingMetrics::new()?;
    let supervisor = Supervisor::new(&config, Arc::new(MqttConnector::new()), metrics)?;

    match supervisor.run(spawn_signal_listener()).await {
        Ok(()) => {
            info!("mqtt pinger stopped");
            Ok(())
        }
        Err(e) if e.is_forced() => {
            error!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("application returned an error: {e}");
            std::process::exit(1);
        }
    }
}
