/// Radio backends
///
/// The engine reaches the platform scanner through the narrow `RadioPrimitive`
/// capability: begin a scan delivering into a `SightingSink`, end it. Two
/// backend strategies sit on top of that primitive and are chosen once, at
/// engine construction, by probing the primitive's capabilities:
///
/// - **legacy**: the engine opens an unfiltered scan for each active window
///   and closes it at the end; all filtering happens in the engine.
/// - **native**: the platform scans continuously with the merged filter set
///   and stamps results in its own clock; the engine only forwards.
///
/// Both feed the same sink contract, so consumers cannot tell them apart.

pub mod legacy;
pub mod native;
pub mod sink;

pub use legacy::LegacyBackend;
pub use native::NativeBackend;
pub use sink::{ClockDomain, RawSighting, SightingSink};

use crate::clock::Clock;
use crate::filter::ScanFilter;
use crate::settings::PowerMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Reasons the platform declined to scan
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioError {
    #[error("Scan permission denied")]
    PermissionDenied,
    #[error("Radio hardware unavailable")]
    HardwareUnavailable,
    #[error("Too many concurrent hardware filters")]
    TooManyFilters,
    #[error("Scan already in progress")]
    AlreadyScanning,
    #[error("Platform error: {0}")]
    Platform(String),
}

// ============================================================================
// PLATFORM PRIMITIVE
// ============================================================================

/// What the platform scanner can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioCapabilities {
    /// Hardware/OS filter offload with continuous platform-managed scanning
    pub offloaded_filtering: bool,
}

/// Scan request handed to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFilterSpec {
    /// Filters the platform should apply; empty means unfiltered
    pub filters: Vec<ScanFilter>,
    /// Power mode the platform should scan with
    pub mode: PowerMode,
}

impl RawFilterSpec {
    pub fn unfiltered(mode: PowerMode) -> Self {
        Self {
            filters: Vec::new(),
            mode,
        }
    }
}

/// Platform scanning primitive
pub trait RadioPrimitive: Send + Sync {
    /// Probe what this platform supports
    fn capabilities(&self) -> RadioCapabilities;

    /// Begin continuous scanning, delivering raw sightings into `sink`
    fn begin_scan(&self, spec: &RawFilterSpec, sink: SightingSink) -> Result<(), RadioError>;

    /// Stop scanning. Must be safe to call when not scanning.
    fn end_scan(&self);

    /// Current reading of the clock the platform stamps results with
    /// (e.g. time since boot). Only consulted when the platform stamps results.
    fn local_clock_nanos(&self) -> Option<u64> {
        None
    }
}

// ============================================================================
// BACKEND STRATEGY
// ============================================================================

/// What the engine wants the radio doing right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioRequest {
    /// Merged filters across all clients (empty = unfiltered)
    pub filters: Vec<ScanFilter>,
    /// Effective power mode
    pub mode: PowerMode,
    /// Active window length of the current timing; zero pauses the radio
    pub active: Duration,
}

/// Which strategy a backend runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    ContinuousLegacy,
    NativeFiltered,
}

/// Closed set of backend strategies behind one interface
pub enum RadioBackend {
    ContinuousLegacy(LegacyBackend),
    NativeFiltered(NativeBackend),
}

impl RadioBackend {
    /// Select the strategy the primitive supports
    pub fn probe(primitive: Arc<dyn RadioPrimitive>) -> Self {
        if primitive.capabilities().offloaded_filtering {
            RadioBackend::NativeFiltered(NativeBackend::new(primitive))
        } else {
            RadioBackend::ContinuousLegacy(LegacyBackend::new(primitive))
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::ContinuousLegacy(_) => BackendKind::ContinuousLegacy,
            Self::NativeFiltered(_) => BackendKind::NativeFiltered,
        }
    }

    /// Bring the radio in line with `request`. A no-op when nothing changed.
    pub fn start(&self, request: &RadioRequest, sink: &SightingSink) -> Result<(), RadioError> {
        match self {
            Self::ContinuousLegacy(b) => b.start(request, sink),
            Self::NativeFiltered(b) => b.start(request, sink),
        }
    }

    /// Apply a changed request to a session that is already running.
    ///
    /// The legacy strategy picks up new filters and timing on its next window;
    /// the native strategy restarts the platform scan when needed.
    pub fn reconfigure(&self, request: &RadioRequest, sink: &SightingSink) -> Result<(), RadioError> {
        match self {
            Self::ContinuousLegacy(b) => {
                b.reconfigure(request);
                Ok(())
            }
            Self::NativeFiltered(b) => b.start(request, sink),
        }
    }

    /// Stop all scanning
    pub fn stop(&self) {
        match self {
            Self::ContinuousLegacy(b) => b.stop(),
            Self::NativeFiltered(b) => b.stop(),
        }
    }

    /// Hold one active window open. Runs on the cycle-tick thread only.
    pub fn run_active_window(
        &self,
        active: Duration,
        mode: PowerMode,
        clock: &dyn Clock,
        sink: &SightingSink,
    ) -> Result<(), RadioError> {
        match self {
            Self::ContinuousLegacy(b) => b.run_active_window(active, mode, clock, sink),
            Self::NativeFiltered(b) => {
                b.run_active_window(active, clock);
                Ok(())
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        match self {
            Self::ContinuousLegacy(b) => b.is_scanning(),
            Self::NativeFiltered(b) => b.is_scanning(),
        }
    }
}
