//! Configuration types and utilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime knobs for the rewrite and colorize pipelines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Background replay settings
    pub replay: ReplayConfig,
    /// Upper bound on matches scanned per mirror rule in one message
    pub max_matches_per_rule: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replay: ReplayConfig::default(),
            max_matches_per_rule: 4096,
        }
    }
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Per-replay timeout in seconds
    pub timeout_secs: u64,
    /// Redirects followed by a single replay
    pub max_redirects: usize,
    /// Pending replays held before new submissions are rejected
    pub queue_capacity: usize,
    /// Send replays through this proxy so they get recorded as flows
    pub upstream_proxy: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_redirects: 3,
            queue_capacity: 256,
            upstream_proxy: None,
        }
    }
}

impl ReplayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"replay": {"timeout_secs": 3}}"#).unwrap();
        assert_eq!(config.replay.timeout(), Duration::from_secs(3));
        assert_eq!(config.replay.max_redirects, 3);
        assert_eq!(config.max_matches_per_rule, 4096);
        assert!(config.replay.upstream_proxy.is_none());
    }
}
