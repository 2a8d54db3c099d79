//! Replays queued mutations once the backend is reachable again.

use crate::{
    backend_client::BackendApi,
    services::{connectivity::Connectivity, offline_queue::OfflineQueue},
};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, watch};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Wait after a connectivity restore before replaying
    pub settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncError {
    pub operation_id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    pub errors: Vec<SyncError>,
    /// Replayed successfully but still queued; the next replay sends them again
    pub stale_operations: Vec<String>,
}

pub struct SyncEngine<B> {
    backend: B,
    queue: Arc<OfflineQueue>,
    config: SyncConfig,
    replay_lock: Mutex<()>,
}

impl<B> SyncEngine<B>
where
    B: BackendApi,
{
    pub fn new(backend: B, queue: Arc<OfflineQueue>, config: SyncConfig) -> Self {
        Self {
            backend,
            queue,
            config,
            replay_lock: Mutex::new(()),
        }
    }

    /// Replay every queued operation in enqueue order.
    ///
    /// Operations are sent one after another. A failed operation stays queued
    /// and does not stop the ones after it. Concurrent calls run one batch at
    /// a time.
    pub async fn replay_all(&self) -> Result<SyncResult> {
        let _guard = self.replay_lock.lock().await;
        self.replay().await
    }

    /// React to the backend becoming reachable.
    ///
    /// Returns `None` when a batch is already settling or running; that batch
    /// will pick up anything queued before it lists the queue.
    pub async fn on_connectivity_restored(&self) -> Option<Result<SyncResult>> {
        let Ok(_guard) = self.replay_lock.try_lock() else {
            debug!("sync already in progress, dropping trigger");
            return None;
        };

        info!(
            "connectivity restored, syncing in {}s",
            self.config.settle_delay.as_secs_f32()
        );
        tokio::time::sleep(self.config.settle_delay).await;

        Some(self.replay().await)
    }

    async fn replay(&self) -> Result<SyncResult> {
        let mut operations = self.queue.list()?;
        // stable, so equal timestamps keep insertion order
        operations.sort_by_key(|op| op.timestamp);

        let mut result = SyncResult {
            total_operations: operations.len(),
            ..Default::default()
        };

        if operations.is_empty() {
            debug!("nothing to sync");
            result.success = true;
            return Ok(result);
        }

        info!("syncing {} pending operations", operations.len());

        for op in operations {
            match self
                .backend
                .send(op.method, &op.endpoint, op.data.as_ref())
                .await
            {
                Ok(_) => {
                    result.successful_operations += 1;
                    if let Err(e) = self.remove_synced(&op.id) {
                        error!(
                            "failed to remove synced operation {}, it will be replayed again: {e:#}",
                            op.id
                        );
                        result.stale_operations.push(op.id);
                    }
                }
                Err(e) => {
                    warn!("failed to sync {} {} ({}): {e}", op.method, op.endpoint, op.id);
                    result.failed_operations += 1;
                    result.errors.push(SyncError {
                        operation_id: op.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        result.success = result.failed_operations == 0;
        info!(
            "sync finished: {} of {} succeeded",
            result.successful_operations, result.total_operations
        );

        Ok(result)
    }

    /// Remove a replayed operation, retrying once
    fn remove_synced(&self, id: &str) -> Result<()> {
        self.queue.remove(id).or_else(|e| {
            warn!("failed to remove synced operation {id}, retrying: {e:#}");
            self.queue.remove(id)
        })
    }
}

impl<B> SyncEngine<B>
where
    B: BackendApi + Send + 'static,
{
    /// Trigger a replay on every offline to online transition until the
    /// sender goes away
    pub async fn run(self: Arc<Self>, mut connectivity: watch::Receiver<Connectivity>) {
        let mut previous = *connectivity.borrow_and_update();

        while connectivity.changed().await.is_ok() {
            let current = *connectivity.borrow_and_update();

            if previous == Connectivity::Offline && current == Connectivity::Online {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    match engine.on_connectivity_restored().await {
                        Some(Ok(result)) if !result.success => {
                            warn!("{} operations remain queued", result.failed_operations)
                        }
                        Some(Err(e)) => error!("sync failed: {e:#}"),
                        _ => {}
                    }
                });
            }

            previous = current;
        }

        debug!("connectivity channel closed, stopping sync engine");
    }
}
