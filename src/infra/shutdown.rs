//! Process shutdown signal
//!
//! SIGINT and SIGTERM both flip the `watch` flag the supervisor selects on, so a
//! `systemctl stop` gets the same teardown (driver stopped, pins released) as Ctrl+C.

use std::io;
use tokio::sync::watch;
use tracing::info;

/// Register the signal handlers and return the shutdown flag.
///
/// Must be called from inside the tokio runtime.
pub fn install_shutdown_handler() -> io::Result<watch::Receiver<bool>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            info!(signal = name, "shutdown_signal_received");
            let _ = shutdown_tx.send(true);
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!(signal = "ctrl_c", "shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    Ok(shutdown_rx)
}
