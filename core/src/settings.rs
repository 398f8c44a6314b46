// Scan settings — power modes, cycle timing and per-client delivery policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

// Low Power: 150 second period with 1.5 seconds active (1% duty cycle)
pub const LOW_POWER_ACTIVE_MILLIS: u64 = 1500;
pub const LOW_POWER_IDLE_MILLIS: u64 = 148_500;

// Balanced: 15 second period with 1.5 seconds active (10% duty cycle)
pub const BALANCED_ACTIVE_MILLIS: u64 = 1500;
pub const BALANCED_IDLE_MILLIS: u64 = 13_500;

// Low Latency: 1.67 second period with 1.5 seconds active (90% duty cycle)
pub const LOW_LATENCY_ACTIVE_MILLIS: u64 = 1500;
pub const LOW_LATENCY_IDLE_MILLIS: u64 = 167;

/// Number of full cycles without a sighting before a device is considered lost
pub const SCAN_LOST_CYCLES: u32 = 4;

/// Named scan-timing profile, ordered by priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    LowPower,
    Balanced,
    LowLatency,
}

impl PowerMode {
    pub const ALL: [PowerMode; 3] = [PowerMode::LowPower, PowerMode::Balanced, PowerMode::LowLatency];
}

impl Default for PowerMode {
    fn default() -> Self {
        PowerMode::Balanced
    }
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowPower => write!(f, "LowPower"),
            Self::Balanced => write!(f, "Balanced"),
            Self::LowLatency => write!(f, "LowLatency"),
        }
    }
}

/// One duty cycle: active scan window followed by idle sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTiming {
    /// Active scan window in milliseconds; 0 pauses scanning
    pub active_ms: u64,
    /// Idle time in milliseconds before the next cycle
    pub idle_ms: u64,
}

impl CycleTiming {
    pub const fn new(active_ms: u64, idle_ms: u64) -> Self {
        Self { active_ms, idle_ms }
    }

    /// Full cycle length in milliseconds
    pub fn cycle_ms(&self) -> u64 {
        self.active_ms.saturating_add(self.idle_ms)
    }

    /// Active window as a percentage of the full cycle
    pub fn duty_cycle_percent(&self) -> u8 {
        let cycle = self.cycle_ms();
        if cycle == 0 {
            return 0;
        }
        ((self.active_ms * 100) / cycle) as u8
    }
}

/// Kind of match notification delivered to a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Address transitioned into "seen" for this consumer
    FirstMatch,
    /// Further sighting of an already-seen address
    AllMatches,
    /// Previously seen address went stale and was evicted
    MatchLost,
}

impl MatchKind {
    fn bit(self) -> u8 {
        match self {
            Self::FirstMatch => DeliveryPolicy::FIRST_MATCH.0,
            Self::AllMatches => DeliveryPolicy::ALL_MATCHES.0,
            Self::MatchLost => DeliveryPolicy::MATCH_LOST.0,
        }
    }
}

/// Bitset of the `MatchKind`s a consumer wants delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryPolicy(u8);

impl DeliveryPolicy {
    pub const NONE: DeliveryPolicy = DeliveryPolicy(0);
    pub const FIRST_MATCH: DeliveryPolicy = DeliveryPolicy(1);
    pub const ALL_MATCHES: DeliveryPolicy = DeliveryPolicy(1 << 1);
    pub const MATCH_LOST: DeliveryPolicy = DeliveryPolicy(1 << 2);

    pub fn contains(self, kind: MatchKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// True when sightings produce match callbacks at all
    pub fn wants_matches(self) -> bool {
        self.contains(MatchKind::FirstMatch) || self.contains(MatchKind::AllMatches)
    }

    /// True when eviction of a seen address produces a MATCH_LOST callback
    pub fn wants_lost(self) -> bool {
        self.contains(MatchKind::AllMatches) || self.contains(MatchKind::MatchLost)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::FIRST_MATCH
    }
}

impl BitOr for DeliveryPolicy {
    type Output = DeliveryPolicy;

    fn bitor(self, rhs: Self) -> Self::Output {
        DeliveryPolicy(self.0 | rhs.0)
    }
}

/// Per-client scan request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSettings {
    pub mode: PowerMode,
    pub policy: DeliveryPolicy,
}

impl ScanSettings {
    pub fn new(mode: PowerMode, policy: DeliveryPolicy) -> Self {
        Self { mode, policy }
    }
}
