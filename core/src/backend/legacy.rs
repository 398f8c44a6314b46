// Continuous-legacy backend
//
// For platforms without filter offload. The engine opens an unfiltered raw
// scan for each active window, sleeps for the window on the tick thread, then
// closes it. Sightings are stamped on arrival with the engine clock.

use super::{ClockDomain, RadioError, RadioPrimitive, RadioRequest, RawFilterSpec, SightingSink};
use crate::clock::Clock;
use crate::settings::PowerMode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Open window, tagged with the epoch it was opened in
#[derive(Debug, Default)]
struct WindowState {
    open: bool,
    epoch: u64,
}

pub struct LegacyBackend {
    primitive: Arc<dyn RadioPrimitive>,
    window: Mutex<WindowState>,
}

impl LegacyBackend {
    pub fn new(primitive: Arc<dyn RadioPrimitive>) -> Self {
        debug!("Continuous-legacy radio backend selected");
        Self {
            primitive,
            window: Mutex::new(WindowState::default()),
        }
    }

    /// Open a scan window right away so a start failure reaches the caller.
    ///
    /// Filters and mode changes need no radio restart here; they only change
    /// what the engine does with results and how long the next window lasts.
    pub fn start(&self, request: &RadioRequest, sink: &SightingSink) -> Result<(), RadioError> {
        if request.active.is_zero() {
            debug!("Active window is zero, radio stays off");
            self.stop();
            return Ok(());
        }
        self.open_window(request.mode, sink).map(|_| ())
    }

    /// Apply a changed request to a running session. Only a zero active
    /// window has an effect: the radio goes off until timing changes again.
    pub fn reconfigure(&self, request: &RadioRequest) {
        if request.active.is_zero() {
            debug!("Active window is zero, pausing legacy scan");
            self.stop();
        }
    }

    /// Returns the epoch of the window now open
    fn open_window(&self, mode: PowerMode, sink: &SightingSink) -> Result<u64, RadioError> {
        let mut window = self.window.lock();
        if window.open {
            return Ok(window.epoch);
        }
        self.primitive
            .begin_scan(&RawFilterSpec::unfiltered(mode), sink.with_domain(ClockDomain::Arrival))?;
        window.open = true;
        window.epoch += 1;
        info!("Legacy scan window opened ({:?})", mode);
        Ok(window.epoch)
    }

    pub fn stop(&self) {
        let mut window = self.window.lock();
        if window.open {
            self.primitive.end_scan();
            window.open = false;
            info!("Legacy scan stopped");
        }
    }

    /// Scan for `active`, then close the window.
    ///
    /// A window stopped and reopened while this one slept belongs to whoever
    /// reopened it and is left open.
    pub fn run_active_window(
        &self,
        active: Duration,
        mode: PowerMode,
        clock: &dyn Clock,
        sink: &SightingSink,
    ) -> Result<(), RadioError> {
        if active.is_zero() {
            self.stop();
            return Ok(());
        }
        let epoch = match self.open_window(mode, sink) {
            Ok(epoch) => epoch,
            Err(e) => {
                error!("Failed to start the legacy scan window: {}", e);
                return Err(e);
            }
        };

        debug!("Starting BLE active scan window ({:?})", active);
        clock.sleep(active);

        let mut window = self.window.lock();
        if window.open && window.epoch == epoch {
            self.primitive.end_scan();
            window.open = false;
            debug!("BLE active scan window closed");
        } else {
            debug!("Scan window {} was replaced while active, leaving it", epoch);
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.window.lock().open
    }
}
