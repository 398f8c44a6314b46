// Engine configuration

use crate::settings::{
    CycleTiming, PowerMode, BALANCED_ACTIVE_MILLIS, BALANCED_IDLE_MILLIS, LOW_LATENCY_ACTIVE_MILLIS,
    LOW_LATENCY_IDLE_MILLIS, LOW_POWER_ACTIVE_MILLIS, LOW_POWER_IDLE_MILLIS, SCAN_LOST_CYCLES,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid cycle timing for {mode}: {reason}")]
    InvalidTiming { mode: String, reason: String },
    #[error("lost_cycles must be > 0")]
    ZeroLostCycles,
    #[error("sighting_channel_capacity must be > 0")]
    ZeroChannelCapacity,
}

/// Engine configuration: timing per power mode and staleness policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanEngineConfig {
    /// Timing for `PowerMode::LowPower`
    pub low_power: CycleTiming,
    /// Timing for `PowerMode::Balanced`
    pub balanced: CycleTiming,
    /// Timing for `PowerMode::LowLatency`
    pub low_latency: CycleTiming,
    /// Cycles without a sighting before a device is lost
    pub lost_cycles: u32,
    /// Absolute staleness cutoff overriding `lost_cycles`
    pub lost_override_ms: Option<u64>,
    /// Full timing override bypassing mode-derived timing
    pub custom_timing: Option<CycleTiming>,
    /// Capacity of the radio → engine sighting channel
    pub sighting_channel_capacity: usize,
}

impl Default for ScanEngineConfig {
    fn default() -> Self {
        Self {
            low_power: CycleTiming::new(LOW_POWER_ACTIVE_MILLIS, LOW_POWER_IDLE_MILLIS),
            balanced: CycleTiming::new(BALANCED_ACTIVE_MILLIS, BALANCED_IDLE_MILLIS),
            low_latency: CycleTiming::new(LOW_LATENCY_ACTIVE_MILLIS, LOW_LATENCY_IDLE_MILLIS),
            lost_cycles: SCAN_LOST_CYCLES,
            lost_override_ms: None,
            custom_timing: None,
            sighting_channel_capacity: 256,
        }
    }
}

impl ScanEngineConfig {
    /// Timing bound to `mode`
    pub fn timing_for(&self, mode: PowerMode) -> CycleTiming {
        match mode {
            PowerMode::LowPower => self.low_power,
            PowerMode::Balanced => self.balanced,
            PowerMode::LowLatency => self.low_latency,
        }
    }

    /// Set a custom timing override
    pub fn with_custom_timing(mut self, active_ms: u64, idle_ms: u64) -> Self {
        self.custom_timing = Some(CycleTiming::new(active_ms, idle_ms));
        self
    }

    /// Set an absolute staleness cutoff
    pub fn with_lost_override_ms(mut self, lost_ms: u64) -> Self {
        self.lost_override_ms = Some(lost_ms);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for mode in PowerMode::ALL {
            let timing = self.timing_for(mode);
            if timing.active_ms == 0 {
                return Err(ConfigError::InvalidTiming {
                    mode: mode.to_string(),
                    reason: "active window must be > 0 (use custom_timing to pause)".to_string(),
                });
            }
            if timing.cycle_ms() == 0 {
                return Err(ConfigError::InvalidTiming {
                    mode: mode.to_string(),
                    reason: "cycle length must be > 0".to_string(),
                });
            }
        }
        if let Some(custom) = self.custom_timing {
            if custom.idle_ms == 0 {
                return Err(ConfigError::InvalidTiming {
                    mode: "custom".to_string(),
                    reason: "idle time must be > 0".to_string(),
                });
            }
        }
        if self.lost_cycles == 0 {
            return Err(ConfigError::ZeroLostCycles);
        }
        if self.sighting_channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }
}
