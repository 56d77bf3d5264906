//! Configuration for the analysis pipeline

use crate::model::PurdueLevel;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Default bound on the packet submission queue
pub const DEFAULT_PACKET_QUEUE: usize = 4096;

/// Default bound on the worker-to-aggregator result channel
pub const DEFAULT_RESULT_QUEUE: usize = 4096;

/// Default detection cache capacity (entries)
pub const DEFAULT_CACHE_CAPACITY: usize = 8192;

/// A manual classification override for one host or CIDR range.
///
/// Overrides always win over the heuristic classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Host address or CIDR range the rule applies to
    pub network: IpNetwork,

    /// Forced Purdue level
    pub level: PurdueLevel,

    /// Optional forced role tag
    #[serde(default)]
    pub role: Option<String>,
}

/// Main configuration structure for the packet analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent packet workers
    pub workers: usize,

    /// Bound of the packet submission queue (submission blocks when full)
    pub packet_queue: usize,

    /// Bound of the worker result channel (results drop when full)
    pub result_queue: usize,

    /// Detection result cache capacity in entries
    pub cache_capacity: usize,

    /// Enable MAC vendor lookups (performed by an external service)
    pub vendor_lookup: bool,

    /// Enable reverse DNS lookups (performed by an external service)
    pub dns_lookup: bool,

    /// Fast mode: disables both lookups and narrows worker/cache sizing
    pub fast_mode: bool,

    /// Progress report interval in seconds (0 disables the ticker)
    pub report_interval_secs: u64,

    /// Manual level/role overrides, first matching rule wins
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            packet_queue: DEFAULT_PACKET_QUEUE,
            result_queue: DEFAULT_RESULT_QUEUE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            vendor_lookup: true,
            dns_lookup: true,
            fast_mode: false,
            report_interval_secs: 5,
            overrides: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the packet queue bound
    pub fn with_packet_queue(mut self, bound: usize) -> Self {
        self.packet_queue = bound;
        self
    }

    /// Set the result queue bound
    pub fn with_result_queue(mut self, bound: usize) -> Self {
        self.result_queue = bound;
        self
    }

    /// Set the detection cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Enable fast mode: no lookups, half the workers, quarter the cache
    pub fn with_fast_mode(mut self) -> Self {
        self.fast_mode = true;
        self.vendor_lookup = false;
        self.dns_lookup = false;
        self.workers = (self.workers / 2).max(1);
        self.cache_capacity = (self.cache_capacity / 4).max(64);
        self
    }

    /// Add a manual override rule
    pub fn with_override(mut self, rule: OverrideRule) -> Self {
        self.overrides.push(rule);
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(crate::AnalysisError::ConfigError(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.packet_queue == 0 || self.result_queue == 0 {
            return Err(crate::AnalysisError::ConfigError(
                "queue bounds must be greater than zero".to_string(),
            ));
        }
        if self.cache_capacity < 2 {
            return Err(crate::AnalysisError::ConfigError(
                "cache capacity must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Find the first override rule matching an address
    pub fn override_for(&self, addr: IpAddr) -> Option<&OverrideRule> {
        self.overrides.iter().find(|rule| rule.network.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig::default().with_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fast_mode_narrows_sizing() {
        let base = EngineConfig::default().with_workers(8).with_cache_capacity(8192);
        let fast = base.with_fast_mode();
        assert!(fast.fast_mode);
        assert!(!fast.vendor_lookup);
        assert!(!fast.dns_lookup);
        assert_eq!(fast.workers, 4);
        assert_eq!(fast.cache_capacity, 2048);
    }

    #[test]
    fn test_override_matching() {
        let rule = OverrideRule {
            network: "10.1.0.0/16".parse().unwrap(),
            level: PurdueLevel::L1,
            role: Some("Safety PLC".to_string()),
        };
        let config = EngineConfig::default().with_override(rule);

        let hit = config.override_for("10.1.2.3".parse().unwrap());
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().level, PurdueLevel::L1);

        assert!(config.override_for("192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_from_toml() {
        let toml_str = r#"
            workers = 2
            packet_queue = 128
            result_queue = 128
            cache_capacity = 256
            vendor_lookup = false
            dns_lookup = false
            fast_mode = false
            report_interval_secs = 0

            [[overrides]]
            network = "192.168.10.5/32"
            level = "L2"
            role = "Historian"
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.overrides.len(), 1);
        assert_eq!(config.overrides[0].level, PurdueLevel::L2);
    }
}
