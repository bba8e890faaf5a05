use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Install SIGINT and SIGTERM handlers. The returned future resolves with the
/// name of the first signal received.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        info!("received {name}");
        name
    })
}
