// Sighting sink handed to the platform radio
//
// The platform calls `deliver` on its own callback thread. The sink decodes the
// payload, moves the timestamp into the engine clock domain and hands the
// sighting to the engine over a bounded channel; it never touches engine state
// directly, so a platform that delivers synchronously from inside `begin_scan`
// cannot deadlock against the engine lock.

use crate::clock::Clock;
use crate::sighting::Sighting;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Raw advertisement as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSighting {
    /// Device address
    pub address: String,
    /// Undecoded advertising payload
    pub payload: Vec<u8>,
    /// Signal strength in dBm
    pub rssi: i32,
    /// Timestamp in the platform's local monotonic clock, if the platform stamps results
    pub local_timestamp_nanos: Option<u64>,
}

impl RawSighting {
    pub fn new(address: impl Into<String>, payload: Vec<u8>, rssi: i32) -> Self {
        Self {
            address: address.into(),
            payload,
            rssi,
            local_timestamp_nanos: None,
        }
    }

    /// Attach a platform-local timestamp
    pub fn with_local_timestamp(mut self, nanos: u64) -> Self {
        self.local_timestamp_nanos = Some(nanos);
        self
    }
}

/// How a sink maps platform timestamps onto engine time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockDomain {
    /// Stamp with the engine clock on arrival
    Arrival,
    /// Platform stamps in its own clock; add `offset_nanos` to convert
    LocalOffset { offset_nanos: i128 },
}

/// Cloneable handle through which a platform delivers raw sightings
#[derive(Clone)]
pub struct SightingSink {
    tx: mpsc::Sender<Sighting>,
    clock: Arc<dyn Clock>,
    domain: ClockDomain,
}

impl SightingSink {
    pub(crate) fn new(tx: mpsc::Sender<Sighting>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tx,
            clock,
            domain: ClockDomain::Arrival,
        }
    }

    /// Same channel, different timestamp conversion
    pub fn with_domain(&self, domain: ClockDomain) -> Self {
        Self {
            domain,
            ..self.clone()
        }
    }

    /// Offset converting a platform clock reading taken "now" into engine time
    pub fn offset_from_local(&self, local_now_nanos: u64) -> ClockDomain {
        ClockDomain::LocalOffset {
            offset_nanos: self.clock.now_nanos() as i128 - local_now_nanos as i128,
        }
    }

    pub fn domain(&self) -> ClockDomain {
        self.domain
    }

    /// Convert a platform timestamp into engine nanoseconds
    pub fn engine_timestamp(&self, local_timestamp_nanos: Option<u64>) -> u64 {
        match (self.domain, local_timestamp_nanos) {
            (ClockDomain::LocalOffset { offset_nanos }, Some(local)) => {
                (local as i128 + offset_nanos).clamp(0, u64::MAX as i128) as u64
            }
            _ => self.clock.now_nanos(),
        }
    }

    /// Hand a raw sighting to the engine.
    ///
    /// Returns false when the sighting was dropped (channel full or engine gone).
    pub fn deliver(&self, raw: RawSighting) -> bool {
        let observed_at = self.engine_timestamp(raw.local_timestamp_nanos);
        let sighting = Sighting::from_raw(raw.address, &raw.payload, raw.rssi, observed_at);

        match self.tx.try_send(sighting) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                warn!("Sighting channel full, dropping sighting of {}", dropped.address);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Engine gone, discarding sighting");
                false
            }
        }
    }
}
