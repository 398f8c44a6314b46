/// Duty cycle scheduling
///
/// Owns the active/idle timing of the currently effective power mode, the
/// optional overrides, and the bookkeeping that makes re-arming idempotent.
/// Each arm bumps a generation counter; a wake carrying an older generation
/// (a duplicate or a redelivery after restart) is ignored instead of starting a
/// second scan cycle.

use crate::config::ScanEngineConfig;
use crate::settings::{CycleTiming, PowerMode};
use crate::wake::{WakeCallback, WakeFacility};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Pending wake bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmState {
    pub generation: u64,
    pub deadline_nanos: u64,
}

/// Timing and wake management for the scan duty cycle
pub struct DutyCycleScheduler {
    config: ScanEngineConfig,
    mode: Option<PowerMode>,
    wake: Arc<dyn WakeFacility>,
    armed: Option<ArmState>,
    generation: u64,
}

impl DutyCycleScheduler {
    pub fn new(config: ScanEngineConfig, wake: Arc<dyn WakeFacility>) -> Self {
        Self {
            config,
            mode: None,
            wake,
            armed: None,
            generation: 0,
        }
    }

    /// Highest-priority mode among `modes`, or `None` ("no scan") when empty
    pub fn compute_effective_mode<I>(modes: I) -> Option<PowerMode>
    where
        I: IntoIterator<Item = PowerMode>,
    {
        modes.into_iter().max()
    }

    /// Apply a newly resolved mode. Returns true when it changed.
    pub fn apply_mode(&mut self, mode: Option<PowerMode>) -> bool {
        if self.mode == mode {
            return false;
        }
        info!("Effective scan mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        true
    }

    pub fn mode(&self) -> Option<PowerMode> {
        self.mode
    }

    /// Timing in force: the custom override if set, else the effective mode's
    pub fn timing(&self) -> CycleTiming {
        self.timing_for(self.mode)
    }

    /// Timing that would be in force under `mode`
    pub fn timing_for(&self, mode: Option<PowerMode>) -> CycleTiming {
        match self.config.custom_timing {
            Some(custom) => custom,
            None => self.config.timing_for(mode.unwrap_or_default()),
        }
    }

    pub fn scan_active_millis(&self) -> u64 {
        self.timing().active_ms
    }

    pub fn scan_idle_millis(&self) -> u64 {
        self.timing().idle_ms
    }

    pub fn scan_cycle_millis(&self) -> u64 {
        self.timing().cycle_ms()
    }

    /// Replace or clear the full timing override
    pub fn set_custom_timing(&mut self, timing: Option<CycleTiming>) {
        self.config.custom_timing = timing;
    }

    /// Replace or clear the absolute staleness override
    pub fn set_lost_override(&mut self, lost: Option<Duration>) {
        self.config.lost_override_ms = lost.map(|d| d.as_millis() as u64);
    }

    /// Age beyond which a sighting counts as lost
    pub fn lost_threshold(&self) -> Duration {
        let millis = match self.config.lost_override_ms {
            Some(ms) => ms,
            None => (self.config.lost_cycles as u64).saturating_mul(self.scan_cycle_millis()),
        };
        Duration::from_millis(millis)
    }

    /// Earliest observation time that is still fresh at `now_nanos`
    pub fn lost_cutoff_nanos(&self, now_nanos: u64) -> u64 {
        now_nanos.saturating_sub(self.lost_threshold().as_nanos() as u64)
    }

    /// Arm the wake facility to fire after `delay`.
    ///
    /// A pending wake due no later than the requested one is kept and `None`
    /// is returned. Otherwise the wake is (re)armed with a fresh generation,
    /// which `build_callback` receives so the callback can present it back.
    pub fn arm<F>(&mut self, now_nanos: u64, delay: Duration, build_callback: F) -> Option<u64>
    where
        F: FnOnce(u64) -> WakeCallback,
    {
        let deadline_nanos = now_nanos.saturating_add(delay.as_nanos() as u64);
        if let Some(armed) = self.armed {
            if armed.deadline_nanos <= deadline_nanos {
                debug!("Wake already armed (generation {}), keeping it", armed.generation);
                return None;
            }
        }

        self.generation += 1;
        let generation = self.generation;
        self.armed = Some(ArmState {
            generation,
            deadline_nanos,
        });
        self.wake.arm(delay, build_callback(generation));
        debug!("Armed scan wake generation {} in {:?}", generation, delay);
        Some(generation)
    }

    /// Consume a wake. False for stale or duplicate generations.
    pub fn accept_fire(&mut self, generation: u64) -> bool {
        match self.armed {
            Some(armed) if armed.generation == generation => {
                self.armed = None;
                true
            }
            _ => {
                debug!(
                    "Ignoring wake generation {} (current: {:?})",
                    generation,
                    self.armed.map(|a| a.generation)
                );
                false
            }
        }
    }

    /// Cancel any pending wake
    pub fn disarm(&mut self) {
        if self.armed.take().is_some() {
            debug!("Disarmed scan wake");
        }
        self.generation += 1;
        self.wake.cancel();
    }

    pub fn armed(&self) -> Option<ArmState> {
        self.armed
    }
}
