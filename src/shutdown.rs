//! Coordinated shutdown of the daemon's background tasks.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::MeshClient;

/// Grace period for registered tasks once shutdown is signalled
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Owns the cancellation token handed to every long-running task
pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Wait for Ctrl-C, then shut down
    pub async fn wait_for_shutdown(self, client: &MeshClient) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        } else {
            tracing::info!("🛑 Shutdown signal received");
        }
        self.shutdown(client).await;
    }

    /// Disconnect the mesh client, cancel every task and wait for them to
    /// finish, giving up after a grace period
    pub async fn shutdown(mut self, client: &MeshClient) {
        self.cancel_token.cancel();
        client.disconnect().await;

        let handles = std::mem::take(&mut self.task_handles);
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await {
            Ok(()) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshid::NodeId;

    #[tokio::test]
    async fn test_shutdown_cancels_registered_tasks() {
        let client = MeshClient::new(NodeId(1));
        let mut manager = ShutdownManager::new();
        let token = manager.token();
        manager.register_task(tokio::spawn(async move {
            token.cancelled().await;
        }));

        let observer = manager.token();
        manager.shutdown(&client).await;
        assert!(observer.is_cancelled());
    }
}
