use std::sync::Arc;

use chrono::{DateTime, Utc};
use hotfolder_core::{Config, PublishScheduler, WatchRegistry};

/// Shared application state
pub struct AppState {
    config: Config,
    scheduler: PublishScheduler,
    watches: Arc<WatchRegistry>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, scheduler: PublishScheduler, watches: Arc<WatchRegistry>) -> Self {
        Self {
            config,
            scheduler,
            watches,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &PublishScheduler {
        &self.scheduler
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
