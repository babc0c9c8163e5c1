//! Signal handling for cancelling an in-flight merge run.
//!
//! Listens for SIGTERM and SIGINT on Unix platforms and Ctrl+C on all
//! platforms, and cancels the run's token when one arrives. Regions still
//! waiting on the resolver then finish as cancelled and every timeline is
//! saved before the process exits.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `token` on the first termination signal.
pub async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C); cancelling merge run");
        }
        _ = terminate => {
            info!("received SIGTERM; cancelling merge run");
        }
        _ = token.cancelled() => return,
    }
    token.cancel();
}
