//! State machine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the package state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Consecutive reschedules of one checkpoint before the step fails.
    /// With the default poll interval this bounds readiness waits to an hour.
    #[serde(default = "default_max_reschedules")]
    pub max_reschedules: u32,
}

fn default_max_reschedules() -> u32 {
    360
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_reschedules: default_max_reschedules(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(MachineConfig::default().max_reschedules, 360);
    }

    #[test]
    fn test_deserialize_empty() {
        let config: MachineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_reschedules, 360);
    }
}
