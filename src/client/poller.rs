use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::state::QueueClient;

/// Periodic status poll. Each tick tries a (throttled) full load and falls
/// back to a cheap status refresh when the load was skipped.
pub fn spawn_status_poller(client: Arc<QueueClient>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = interval.max(Duration::from_secs(1));
        loop {
            tokio::time::sleep(interval).await;
            match client.load_all(false).await {
                Ok(true) => continue,
                Ok(false) => {
                    if let Err(e) = client.refresh_status().await {
                        debug!("[client] status poll failed: {}", e);
                    }
                }
                // load_all already surfaced the failure
                Err(_) => {}
            }
        }
    })
}
