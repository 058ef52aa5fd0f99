// Background maintenance tasks
// Reclaims orphaned concurrency entries whose lease expired past the grace
// period and prunes stale key-store cache entries.

use std::time::Duration;
use tracing::{info, warn};

use crate::app::AppState;

/// Background task manager for the gateway
pub struct MaintenanceTasks {
    state: AppState,
}

impl MaintenanceTasks {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start all background tasks
    pub fn start(&self) {
        info!("Starting gateway maintenance tasks");
        self.start_orphan_reclaim();
        self.start_cache_prune();
    }

    fn start_orphan_reclaim(&self) {
        let concurrency = self.state.concurrency.clone();
        let grace = Duration::from_secs(self.state.config.concurrency.cleanup_grace_seconds);
        let interval =
            Duration::from_secs(self.state.config.concurrency.cleanup_interval_seconds.max(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match concurrency.cleanup_all(grace).await {
                    Ok(removed) if removed > 0 => {
                        info!("reclaimed {} orphaned concurrency entries", removed);
                    },
                    Ok(_) => {},
                    Err(e) => {
                        warn!("orphan reclamation sweep failed: {}", e);
                    },
                }
            }
        });
    }

    fn start_cache_prune(&self) {
        let key_store = self.state.key_store.clone();
        let interval = Duration::from_secs(60);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                key_store.prune_expired().await;
            }
        });
    }
}

/// Initialize background tasks (call this in main.rs)
pub fn initialize_maintenance_tasks(state: AppState) {
    MaintenanceTasks::new(state).start();
}
