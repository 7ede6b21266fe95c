//! Ctrl-C and SIGTERM handling

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `cancel` on the first SIGINT or SIGTERM. Running operations see
/// the token and unwind; an armed network rollback stays armed.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, cancelling"),
        _ = terminate => info!("Received SIGTERM, cancelling"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
