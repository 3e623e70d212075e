//! Signal handling for graceful daemon shutdown.

use std::fmt;
use tracing::{debug, info, warn};

/// Signals that stop the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
        }
    }
}

/// Wait until SIGINT or, on Unix, SIGTERM arrives.
pub async fn shutdown_signal() -> SignalKind {
    let kind = wait_any().await;
    info!(signal = %kind, "Shutdown signal received");
    kind
}

#[cfg(unix)]
async fn wait_any() -> SignalKind {
    use tokio::signal::unix::{signal, SignalKind as UnixSignal};

    let mut terminate = match signal(UnixSignal::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler not installed");
            return wait_interrupt().await;
        }
    };
    debug!("Signal handlers registered");
    tokio::select! {
        kind = wait_interrupt() => kind,
        _ = terminate.recv() => SignalKind::Terminate,
    }
}

#[cfg(not(unix))]
async fn wait_any() -> SignalKind {
    wait_interrupt().await
}

async fn wait_interrupt() -> SignalKind {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl+C handler failed, waiting forever");
        std::future::pending::<()>().await;
    }
    SignalKind::Interrupt
}
