//! YAML Configuration Structures
//!
//! Every section and field is optional; an empty file yields the defaults.

use layers::rlc::RlcConfig;
use layers::user::UserConfig;
use serde::{Deserialize, Serialize};

/// Main eNodeB configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnbConfig {
    /// RLC configuration
    #[serde(default)]
    pub rlc: RlcConfig,
    /// Timer subsystem configuration
    #[serde(default)]
    pub timers: TimerSettings,
    /// Per-user configuration
    #[serde(default)]
    pub user: UserConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Timer subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimerSettings {
    /// Period of the tick source in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    1
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level used when neither RUST_LOG nor the CLI sets one
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EnbConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        // serde_yaml reads an empty document as null, not as an empty map
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: EnbConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the layers can't run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.rlc.validate()?;
        if self.timers.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("tick_interval_ms must be non-zero"));
        }
        if self.user.max_dl_bytes_per_subframe == 0 {
            return Err(anyhow::anyhow!("max_dl_bytes_per_subframe must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = EnbConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EnbConfig::default());
        assert_eq!(config.rlc.poll_retransmit_ms, 100);
        assert_eq!(config.rlc.um_sn_size, 10);
        assert!(!config.rlc.status_on_poll_only);
        assert_eq!(config.timers.tick_interval_ms, 1);
        assert_eq!(config.user.max_dl_bytes_per_subframe, 325);
        assert_eq!(config.user.c_rnti_reservation_ms, 5000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_sections() {
        let yaml = "\
rlc:
  poll_retransmit_ms: 45
  status_on_poll_only: true
user:
  max_dl_bytes_per_subframe: 100
log:
  level: debug
";
        let config = EnbConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.rlc.poll_retransmit_ms, 45);
        assert!(config.rlc.status_on_poll_only);
        assert_eq!(config.rlc.um_sn_size, 10);
        assert_eq!(config.user.max_dl_bytes_per_subframe, 100);
        assert_eq!(config.user.max_ul_bytes_per_subframe, 50);
        assert_eq!(config.timers, TimerSettings::default());
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EnbConfig::from_yaml_str("rlc:\n  um_sn_size: 7\n").is_err());
        assert!(EnbConfig::from_yaml_str("timers:\n  tick_interval_ms: 0\n").is_err());
        assert!(EnbConfig::from_yaml_str("user:\n  max_dl_bytes_per_subframe: 0\n").is_err());
        assert!(EnbConfig::from_yaml_str("rlc: [1, 2]\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(EnbConfig::from_yaml_file("/nonexistent/enb.yaml").is_err());
    }
}
