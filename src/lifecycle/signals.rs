//! OS signal handling.
//!
//! SIGINT and SIGTERM start the shutdown sequence (Ctrl-C on non-unix
//! targets). The listener keeps running afterwards so repeated signals are
//! logged and ignored instead of killing the process mid-cleanup. All other
//! signals keep their default disposition.

use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::{ShutdownCoordinator, ShutdownError, ShutdownReason};

/// Register the handlers and spawn the listener task.
#[cfg(unix)]
pub fn install(coordinator: ShutdownCoordinator) -> Result<JoinHandle<()>, ShutdownError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| ShutdownError::SignalSetup(e.to_string()))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| ShutdownError::SignalSetup(e.to_string()))?;

    tracing::info!("Signal handlers installed (SIGINT, SIGTERM)");
    Ok(tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                Some(()) = sigint.recv() => ShutdownReason::Interrupt,
                Some(()) = sigterm.recv() => ShutdownReason::Terminate,
                else => break,
            };
            tracing::info!(signal = %reason, "Signal received");
            dispatch(&coordinator, reason);
        }
    }))
}

#[cfg(not(unix))]
pub fn install(coordinator: ShutdownCoordinator) -> Result<JoinHandle<()>, ShutdownError> {
    tracing::info!("Signal handler installed (Ctrl-C)");
    Ok(tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Ctrl-C received");
            dispatch(&coordinator, ShutdownReason::Interrupt);
        }
    }))
}

// Cleanup runs on its own task so later signals are still observed.
fn dispatch(coordinator: &ShutdownCoordinator, reason: ShutdownReason) {
    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        coordinator.initiate(reason).await;
    });
}
