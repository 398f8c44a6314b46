// Configuration management for the blescan CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blescan/config.json
// - Linux: ~/.config/blescan/config.json
// - Windows: %APPDATA%\blescan\config.json

use anyhow::{Context, Result};
use blescan_core::{PowerMode, ScanEngineConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine timing and staleness settings
    pub engine: ScanEngineConfig,

    /// Defaults for `blescan simulate`
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated advertisers
    pub devices: usize,

    /// Duty cycles to run before exiting
    pub cycles: u32,

    /// Power mode the demo consumer asks for
    pub mode: PowerMode,

    /// Cycle after which half of the devices stop advertising
    pub vanish_after: Option<u32>,

    /// Interval between advertisements of one device
    pub advertise_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: 8,
            cycles: 10,
            mode: PowerMode::LowLatency,
            vanish_after: Some(3),
            advertise_interval_ms: 100,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blescan");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Load config from `path`, or create a default one there
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config = serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .engine
                .validate()
                .context("Config file holds an invalid engine configuration")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. A rejected value leaves the config unchanged.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        next.apply(key, value)?;
        next.engine.validate().context("Rejected configuration")?;
        *self = next;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "lost_cycles" => {
                self.engine.lost_cycles = value.parse().context("Invalid number")?;
            }
            "lost_override_ms" => {
                self.engine.lost_override_ms = parse_optional(value)?;
            }
            "sighting_channel_capacity" => {
                self.engine.sighting_channel_capacity = value.parse().context("Invalid number")?;
            }
            "devices" => {
                self.simulation.devices = value.parse().context("Invalid number")?;
            }
            "cycles" => {
                self.simulation.cycles = value.parse().context("Invalid number")?;
            }
            "mode" => {
                self.simulation.mode = parse_mode(value)?;
            }
            "vanish_after" => {
                self.simulation.vanish_after = parse_optional(value)?;
            }
            "advertise_interval_ms" => {
                self.simulation.advertise_interval_ms = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let optional = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "(none)".to_string());
        vec![
            ("lost_cycles".to_string(), self.engine.lost_cycles.to_string()),
            ("lost_override_ms".to_string(), optional(self.engine.lost_override_ms)),
            (
                "sighting_channel_capacity".to_string(),
                self.engine.sighting_channel_capacity.to_string(),
            ),
            ("devices".to_string(), self.simulation.devices.to_string()),
            ("cycles".to_string(), self.simulation.cycles.to_string()),
            ("mode".to_string(), self.simulation.mode.to_string()),
            (
                "vanish_after".to_string(),
                optional(self.simulation.vanish_after.map(u64::from)),
            ),
            (
                "advertise_interval_ms".to_string(),
                self.simulation.advertise_interval_ms.to_string(),
            ),
        ]
    }
}

/// Parse a power mode name as accepted on the command line
pub fn parse_mode(value: &str) -> Result<PowerMode> {
    match value.to_ascii_lowercase().replace('_', "-").as_str() {
        "low-power" | "lowpower" => Ok(PowerMode::LowPower),
        "balanced" => Ok(PowerMode::Balanced),
        "low-latency" | "lowlatency" => Ok(PowerMode::LowLatency),
        other => anyhow::bail!("Unknown power mode: {} (low-power, balanced, low-latency)", other),
    }
}

fn parse_optional<T: std::str::FromStr>(value: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if value.is_empty() || value == "none" {
        Ok(None)
    } else {
        Ok(Some(value.parse().context("Invalid number")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine, ScanEngineConfig::default());
        assert_eq!(config.simulation.mode, PowerMode::LowLatency);
        assert_eq!(config.get("lost_cycles").as_deref(), Some("4"));
    }

    #[test]
    fn test_load_creates_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());

        let mut changed = created.clone();
        changed.set("devices", "3").unwrap();
        changed.set("lost_override_ms", "400").unwrap();
        changed.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.simulation.devices, 3);
        assert_eq!(loaded.engine.lost_override_ms, Some(400));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.set("lost_cycles", "0").is_err());
        assert!(config.set("mode", "turbo").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        assert_eq!(config, Config::default());

        config.set("vanish_after", "none").unwrap();
        assert_eq!(config.simulation.vanish_after, None);
    }

    #[test]
    fn test_rejected_value_does_not_block_later_sets() {
        let mut config = Config::default();
        assert!(config.set("lost_cycles", "0").is_err());
        assert_eq!(config.engine.lost_cycles, 4);

        config.set("lost_cycles", "6").unwrap();
        config.set("devices", "2").unwrap();
        assert_eq!(config.get("lost_cycles").as_deref(), Some("6"));
        assert_eq!(config.simulation.devices, 2);
    }

    #[test]
    fn test_parse_mode_variants() {
        assert_eq!(parse_mode("low_power").unwrap(), PowerMode::LowPower);
        assert_eq!(parse_mode("Balanced").unwrap(), PowerMode::Balanced);
        assert_eq!(parse_mode("low-latency").unwrap(), PowerMode::LowLatency);
        // round-trips the Display form used by `config show`
        assert_eq!(parse_mode(&PowerMode::LowLatency.to_string()).unwrap(), PowerMode::LowLatency);
    }
}
