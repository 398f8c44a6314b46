// Sighting — one observed advertisement from a device at a point in time

use crate::record::ScanRecord;
use serde::{Deserialize, Serialize};

/// An immutable observation of a device's advertisement.
///
/// A newer sighting of the same address supersedes the older one in the cache;
/// sightings themselves are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sighting {
    /// Device address as reported by the radio (e.g. "AA:BB:CC:DD:EE:FF")
    pub address: String,
    /// Decoded advertising payload
    pub record: ScanRecord,
    /// Received signal strength in dBm
    pub rssi: i32,
    /// Observation time in engine nanoseconds
    pub observed_at_nanos: u64,
}

impl Sighting {
    /// Create a sighting from an already decoded record
    pub fn new(address: impl Into<String>, record: ScanRecord, rssi: i32, observed_at_nanos: u64) -> Self {
        Self {
            address: address.into(),
            record,
            rssi,
            observed_at_nanos,
        }
    }

    /// Create a sighting by decoding a raw advertising payload
    pub fn from_raw(address: impl Into<String>, payload: &[u8], rssi: i32, observed_at_nanos: u64) -> Self {
        Self::new(address, ScanRecord::parse(payload), rssi, observed_at_nanos)
    }

    /// Age relative to `now_nanos`; zero when the sighting lies in the future
    pub fn age_nanos(&self, now_nanos: u64) -> u64 {
        now_nanos.saturating_sub(self.observed_at_nanos)
    }

    /// Copy of this sighting re-stamped at `observed_at_nanos`
    pub(crate) fn restamped(&self, observed_at_nanos: u64) -> Self {
        Self {
            observed_at_nanos,
            ..self.clone()
        }
    }
}
