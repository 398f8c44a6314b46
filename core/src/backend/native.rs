// Native-filtered backend
//
// For platforms with chipset filter offload. The platform scans continuously
// with the merged filter set of all clients and stamps results in its own
// clock (typically time since boot); the sink converts those stamps using the
// offset measured when the scan began. Per-client FIRST_MATCH / ALL_MATCHES
// bookkeeping still happens in the engine.

use super::{RadioError, RadioPrimitive, RadioRequest, RawFilterSpec, SightingSink};
use crate::backend::ClockDomain;
use crate::clock::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct NativeBackend {
    primitive: Arc<dyn RadioPrimitive>,
    current: Mutex<Option<RawFilterSpec>>,
}

impl NativeBackend {
    pub fn new(primitive: Arc<dyn RadioPrimitive>) -> Self {
        debug!("Native-filtered radio backend selected");
        Self {
            primitive,
            current: Mutex::new(None),
        }
    }

    /// Restart the platform scan when the merged filters or mode changed.
    ///
    /// On failure the previous scan is restored when possible.
    pub fn start(&self, request: &RadioRequest, sink: &SightingSink) -> Result<(), RadioError> {
        if request.active.is_zero() {
            debug!("Active window is zero, pausing native scan");
            self.stop();
            return Ok(());
        }

        let spec = RawFilterSpec {
            filters: request.filters.clone(),
            mode: request.mode,
        };
        let mut current = self.current.lock();
        if current.as_ref() == Some(&spec) {
            return Ok(());
        }

        let previous = current.take();
        if previous.is_some() {
            self.primitive.end_scan();
        }

        info!(
            "Starting native scan ({:?}, {} filters)",
            spec.mode,
            spec.filters.len()
        );
        match self.primitive.begin_scan(&spec, self.stamped(sink)) {
            Ok(()) => {
                *current = Some(spec);
                Ok(())
            }
            Err(e) => {
                error!("Native scan start failed: {}", e);
                if let Some(previous) = previous {
                    match self.primitive.begin_scan(&previous, self.stamped(sink)) {
                        Ok(()) => *current = Some(previous),
                        Err(restore) => warn!("Could not restore previous native scan: {}", restore),
                    }
                }
                Err(e)
            }
        }
    }

    fn stamped(&self, sink: &SightingSink) -> SightingSink {
        let domain = match self.primitive.local_clock_nanos() {
            Some(local_now) => sink.offset_from_local(local_now),
            None => ClockDomain::Arrival,
        };
        sink.with_domain(domain)
    }

    pub fn stop(&self) {
        if self.current.lock().take().is_some() {
            self.primitive.end_scan();
            info!("Native scan stopped");
        }
    }

    /// The platform keeps scanning on its own; the window only paces the cycle
    pub fn run_active_window(&self, active: Duration, clock: &dyn Clock) {
        if !active.is_zero() {
            clock.sleep(active);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.current.lock().is_some()
    }
}
