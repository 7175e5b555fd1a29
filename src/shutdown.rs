use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit code used when a second signal forces the process down
const FORCED_EXIT: i32 = 130;

/// Install a handler for SIGTERM and SIGINT.
///
/// The first signal cancels the returned token; this is the process-wide
/// "exiting" flag that stops new spawns and respawns. A second signal exits
/// immediately.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let exiting = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };

            if exiting.is_cancelled() {
                tracing::warn!(signal = name, "Second signal, exiting now");
                std::process::exit(FORCED_EXIT);
            }
            tracing::info!(signal = name, "Received signal, shutting down");
            exiting.cancel();
        }
    });

    token
}
