use std::collections::HashSet;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Scheduler admits at least one package and accepts at least one type
/// - Stability quiet period is not 0
/// - Hot folders and platforms are not declared twice
/// - Every platform reference names a configured platform
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if config.scheduler.max_concurrent == 0 {
        return Err(invalid("scheduler.max_concurrent must be greater than 0"));
    }

    if config.scheduler.accepted_types.is_empty() {
        return Err(invalid("scheduler.accepted_types cannot be empty"));
    }

    if config.watcher.stability_quiet_period_ms == 0 {
        return Err(invalid("watcher.stability_quiet_period_ms cannot be 0"));
    }

    if config.pipeline.readiness_poll_interval_ms == 0 {
        return Err(invalid("pipeline.readiness_poll_interval_ms cannot be 0"));
    }

    let mut platforms = HashSet::new();
    for platform in &config.platforms {
        if platform.name.is_empty() {
            return Err(invalid("platform name cannot be empty"));
        }
        if !platforms.insert(platform.name.as_str()) {
            return Err(invalid(format!(
                "platform '{}' is declared twice",
                platform.name
            )));
        }
    }

    let mut folders = HashSet::new();
    for folder in &config.hot_folders {
        if !folders.insert(folder.path.as_path()) {
            return Err(invalid(format!(
                "hot folder {} is declared twice",
                folder.path.display()
            )));
        }
        if let Some(name) = &folder.platform {
            if !platforms.contains(name.as_str()) {
                return Err(invalid(format!(
                    "hot folder {} refers to unknown platform '{}'",
                    folder.path.display(),
                    name
                )));
            }
        }
    }

    if let Some(name) = &config.pipeline.default_platform {
        if !platforms.contains(name.as_str()) {
            return Err(invalid(format!(
                "pipeline.default_platform refers to unknown platform '{}'",
                name
            )));
        }
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}
