// BleScan Core — duty-cycled BLE advertisement scanning
//
// Many consumers, one radio. Each consumer registers filters and a power mode;
// the engine runs a single shared scan session at the most demanding mode,
// caches the latest sighting per device, and tells every consumer when a
// matching device is first seen, seen again, or lost.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod filter;
pub mod record;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod sighting;
pub mod wake;

pub use backend::{
    BackendKind, ClockDomain, RadioBackend, RadioCapabilities, RadioError, RadioPrimitive, RawFilterSpec,
    RawSighting, SightingSink,
};
pub use cache::SightingCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ScanEngineConfig};
pub use engine::{EngineStatus, ScanEngine, ScanError};
pub use filter::{FilterError, ScanFilter, ScanFilterBuilder};
pub use record::ScanRecord;
pub use registry::{ClientId, ScanSink};
pub use scheduler::DutyCycleScheduler;
pub use settings::{CycleTiming, DeliveryPolicy, MatchKind, PowerMode, ScanSettings};
pub use sighting::Sighting;
pub use wake::{ManualWakeFacility, ThreadWakeFacility, WakeCallback, WakeFacility};
