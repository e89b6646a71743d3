//! Media platform abstraction.
//!
//! This module provides a `Platform` trait for the remote video platforms
//! packages are published to, a generic HTTP implementation, and a registry
//! of configured platforms by name.

mod http;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use http::HttpPlatform;
pub use types::*;

use crate::config::PlatformConfig;

/// Configured platforms, by name.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<dyn Platform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an [`HttpPlatform`] for every configured platform.
    pub fn from_config(configs: &[PlatformConfig]) -> Result<Self, PlatformError> {
        let mut registry = Self::new();
        for config in configs {
            let platform = HttpPlatform::new(config.clone())?;
            registry.register(config.name.clone(), Arc::new(platform));
        }
        Ok(registry)
    }

    /// Register a platform under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, platform: Arc<dyn Platform>) {
        self.platforms.insert(name.into(), platform);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.names())
            .finish()
    }
}
