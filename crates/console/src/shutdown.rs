//! Two-stage shutdown on termination signals
//!
//! The first SIGINT/SIGTERM cancels the token the engine was started with so
//! the console can stop gracefully. A second one exits the process at once.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces the process down
pub const FORCED_EXIT_CODE: i32 = 130;

/// What the watcher did after the signal source ended or fired twice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The signal source closed before any signal arrived
    Idle,
    /// One signal arrived; graceful shutdown requested
    Graceful,
    /// Two signals arrived; the force action ran
    Forced,
}

/// Drive the two-stage policy over any signal source
pub async fn two_stage(
    mut signals: mpsc::Receiver<()>,
    token: CancellationToken,
    force: impl FnOnce(),
) -> Shutdown {
    if signals.recv().await.is_none() {
        return Shutdown::Idle;
    }
    tracing::info!("shutdown signal received, stopping");
    token.cancel();

    if signals.recv().await.is_none() {
        return Shutdown::Graceful;
    }
    tracing::warn!("second shutdown signal received, forcing exit");
    force();
    Shutdown::Forced
}

/// Watch process signals and apply the two-stage policy to `token`
pub fn spawn_signal_watcher(token: CancellationToken) -> JoinHandle<Shutdown> {
    let (tx, rx) = mpsc::channel(2);
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                tracing::error!(error = %e, "cannot listen for shutdown signals");
                break;
            }
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    tokio::spawn(two_stage(rx, token, || std::process::exit(FORCED_EXIT_CODE)))
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
