use log::{error, info, warn};

use crate::config::ConfigCenter;

#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }
    info!("Shutdown signal received, draining connections...");
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, draining connections...");
}

/// Reload config.toml on every SIGHUP.
#[cfg(unix)]
pub fn spawn_reload_on_hangup(cc: ConfigCenter) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!("SIGHUP handler unavailable, config reload disabled: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if let Err(e) = cc.reload().await {
                error!("Config reload failed, keeping previous: {e:?}");
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_on_hangup(_cc: ConfigCenter) {}
