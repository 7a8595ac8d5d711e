//! Gauge configuration

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 15;

/// Liters to US gallons
pub const GALLONS_PER_LITER: f64 = 0.264172;

/// Gauge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaugeConfig {
    /// Usable tank volume (liters)
    pub tank_capacity_liters: f64,

    /// Fuel economy used for the range estimate (miles per US gallon)
    pub fuel_economy_mpg: f64,

    /// Where the fuel account is kept
    pub store_path: PathBuf,

    /// Periodic checkpoint of the open trip; `None` saves only on exit
    pub checkpoint_interval_secs: Option<u64>,

    /// Watchdog for a single discovery, read or subscribe request; must be non-zero
    pub discovery_timeout_secs: u64,

    /// Max log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GaugeConfig {
    fn default() -> Self {
        Self {
            tank_capacity_liters: 80.0,
            fuel_economy_mpg: 17.0,
            store_path: PathBuf::from("otgi-account.json"),
            checkpoint_interval_secs: Some(60),
            discovery_timeout_secs: DEFAULT_DISCOVERY_TIMEOUT_SECS,
            log_level: "info".to_string(),
        }
    }
}

impl GaugeConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        if config.discovery_timeout_secs == 0 {
            anyhow::bail!("discovery_timeout_secs in {} must be at least 1", path.display());
        }
        Ok(config)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }

    /// Request watchdog. Zero would fail every request, so it means the default.
    pub fn discovery_timeout(&self) -> Duration {
        match self.discovery_timeout_secs {
            0 => Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Parsed `log_level`, falling back to info
    pub fn max_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otgi.json");
        std::fs::write(&path, r#"{ "tank_capacity_liters": 60.0, "log_level": "debug" }"#).unwrap();

        let config = GaugeConfig::load(&path).unwrap();
        assert_eq!(config.tank_capacity_liters, 60.0);
        assert_eq!(config.fuel_economy_mpg, 17.0);
        assert_eq!(config.max_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = GaugeConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, GaugeConfig::default());
    }

    #[test]
    fn test_zero_interval_disables_checkpoints() {
        let config = GaugeConfig {
            checkpoint_interval_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.checkpoint_interval(), None);
    }

    #[test]
    fn test_zero_discovery_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otgi.json");
        std::fs::write(&path, r#"{ "discovery_timeout_secs": 0 }"#).unwrap();

        let err = GaugeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("discovery_timeout_secs"));
    }

    #[test]
    fn test_zero_discovery_timeout_uses_default() {
        let config = GaugeConfig {
            discovery_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.discovery_timeout(), Duration::from_secs(15));

        let config = GaugeConfig {
            discovery_timeout_secs: 3,
            ..Default::default()
        };
        assert_eq!(config.discovery_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_bad_log_level_falls_back() {
        let config = GaugeConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert_eq!(config.max_level(), tracing::Level::INFO);
    }
}
