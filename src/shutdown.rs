use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel the returned token on SIGTERM or SIGINT.
///
/// The dispatcher stops claiming jobs when the token fires but lets running
/// imports finish; a second signal is not special-cased.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining running imports");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining running imports");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
