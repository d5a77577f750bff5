use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::repository::HoldStore;
use crate::CoreResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub interval_seconds: u64,
    /// Upper bound on holds reclaimed per pass.
    pub batch_size: usize,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            batch_size: 100,
        }
    }
}

/// Reclaims holds whose logical expiry has passed. Claimed holds are not in
/// the expiry index and are never touched.
pub struct CleanupSweeper {
    store: Arc<dyn HoldStore>,
    clock: Arc<dyn Clock>,
    settings: CleanupSettings,
}

impl CleanupSweeper {
    pub fn new(store: Arc<dyn HoldStore>, clock: Arc<dyn Clock>, settings: CleanupSettings) -> Self {
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> &CleanupSettings {
        &self.settings
    }

    pub async fn sweep_once(&self) -> CoreResult<usize> {
        let cleaned = self
            .store
            .sweep_expired(self.clock.now_epoch(), self.settings.batch_size)
            .await?;
        if cleaned > 0 {
            info!("Swept {} expired holds", cleaned);
        } else {
            debug!("No expired holds to sweep");
        }
        Ok(cleaned)
    }
}
