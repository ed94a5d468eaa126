/// Signal handling for graceful shutdown.
///
/// SIGHUP, SIGINT, SIGTERM and SIGQUIT all stop the agent the same way:
/// readers stop, buffered chunks are flushed and sent, state is dumped.
use tokio::signal::unix::{signal, SignalKind};

/// Wait for the first shutdown signal and return its name.
pub async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Resolves once a shutdown signal arrives. If handlers cannot be installed
/// the error is logged and this never resolves.
pub async fn shutdown_requested() {
    match wait_for_shutdown().await {
        Ok(name) => tracing::info!(signal = name, "received signal, shutting down"),
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sighup_is_reported() {
        // Registering here first means a raise can never hit the default action.
        let _guard = signal(SignalKind::hangup()).unwrap();
        let waiter = tokio::spawn(wait_for_shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pid = std::process::id().to_string();
        std::process::Command::new("kill")
            .args(["-HUP", &pid])
            .status()
            .unwrap();

        let name = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(name, "SIGHUP");
    }
}
