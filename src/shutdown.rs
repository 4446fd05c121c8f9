//! OS signals as stop requests
//!
//! Every interrupt/termination signal is forwarded as one message; the supervisor treats the
//! first as a graceful stop request and a second one during shutdown as a forced stop.

use tokio::sync::mpsc;
use tracing::error;

/// Start listening for stop signals
pub fn spawn_signal_listener() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(2);

    tokio::spawn(async move {
        if let Err(e) = listen(tx).await {
            error!("unable to listen for stop signals: {e}");
        }
    });

    rx
}

#[cfg(unix)]
async fn listen(tx: mpsc::Sender<String>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };

        if tx.send(name.to_string()).await.is_err() {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn listen(tx: mpsc::Sender<String>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;

        if tx.send("ctrl-c".to_string()).await.is_err() {
            return Ok(());
        }
    }
}
