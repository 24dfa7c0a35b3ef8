use std::io;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The HTTP server and the sweeper both watch the token. Must be called from
/// within a tokio runtime.
#[cfg(unix)]
pub fn install_shutdown_handler() -> io::Result<CancellationToken> {
    use tokio::signal::unix::{signal, SignalKind};

    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    Ok(token)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
            trigger.cancel();
        }
    });
    Ok(token)
}
