/// Scan engine
///
/// Public face of the crate. Consumers register filters plus settings and get
/// FIRST_MATCH / ALL_MATCHES / MATCH_LOST callbacks; the engine keeps one
/// shared radio session running at the most demanding mode any consumer asked
/// for and drives the duty cycle through the wake facility.
///
/// Locking: every mutation (registry, scheduler, cache writes, radio
/// start/stop) happens under one state mutex. Callbacks are planned under that
/// lock and queued on the engine's outbox in planning order. Whichever thread
/// holds the dispatch token drains the outbox after the state lock is
/// released, so a consumer never sees a MATCH_LOST overtake the FIRST_MATCH
/// that follows it, and may register or unregister from inside its own
/// callback. Cache reads take only the cache's read lock.

use crate::backend::{BackendKind, RadioBackend, RadioError, RadioPrimitive, RadioRequest, SightingSink};
use crate::cache::SightingCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ScanEngineConfig};
use crate::filter::ScanFilter;
use crate::registry::{
    dispatch, merge_filter_sets, ClientId, ClientRegistry, Delivery, ScanEvent, ScanSink, SinkTarget,
};
use crate::scheduler::DutyCycleScheduler;
use crate::settings::{CycleTiming, PowerMode, ScanSettings};
use crate::sighting::Sighting;
use crate::wake::WakeFacility;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::iter;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Radio refused to start scanning: {0}")]
    RadioStartFailure(#[from] RadioError),
    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Sighting pump already running")]
    PumpAlreadyRunning,
    #[error("Failed to spawn engine thread: {0}")]
    Thread(String),
}

// ============================================================================
// STATUS
// ============================================================================

/// Snapshot of engine state for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub clients: usize,
    pub cached_sightings: usize,
    pub effective_mode: Option<PowerMode>,
    pub backend: BackendKind,
    /// A scan session is open (clients registered and the radio accepted)
    pub radio_running: bool,
    /// The radio is listening right now; false between legacy windows
    pub scanning: bool,
    pub armed: bool,
    pub next_wake_in_ms: Option<u64>,
    pub timing: Option<CycleTiming>,
    pub lost_threshold_ms: u64,
}

// ============================================================================
// ENGINE
// ============================================================================

struct EngineState {
    registry: ClientRegistry,
    scheduler: DutyCycleScheduler,
    radio_running: bool,
    cycle_in_flight: bool,
}

struct EngineInner {
    state: Mutex<EngineState>,
    cache: SightingCache,
    backend: RadioBackend,
    clock: Arc<dyn Clock>,
    sink: SightingSink,
    sighting_rx: Mutex<Option<mpsc::Receiver<Sighting>>>,
    outbox: Mutex<VecDeque<Vec<Delivery>>>,
    dispatch_token: Mutex<()>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.state.get_mut().scheduler.disarm();
        self.backend.stop();
    }
}

/// Duty-cycled BLE scan engine.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct ScanEngine {
    inner: Arc<EngineInner>,
}

impl ScanEngine {
    /// Create an engine stamping sightings with the system clock
    pub fn new(
        config: ScanEngineConfig,
        primitive: Arc<dyn RadioPrimitive>,
        wake: Arc<dyn WakeFacility>,
    ) -> Result<Self, ScanError> {
        Self::with_clock(config, primitive, wake, Arc::new(SystemClock))
    }

    /// Create an engine on an explicit clock
    pub fn with_clock(
        config: ScanEngineConfig,
        primitive: Arc<dyn RadioPrimitive>,
        wake: Arc<dyn WakeFacility>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ScanError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.sighting_channel_capacity);
        let backend = RadioBackend::probe(primitive);
        info!("Scan engine created with {:?} backend", backend.kind());

        Ok(Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState {
                    registry: ClientRegistry::new(),
                    scheduler: DutyCycleScheduler::new(config, wake),
                    radio_running: false,
                    cycle_in_flight: false,
                }),
                cache: SightingCache::new(),
                backend,
                sink: SightingSink::new(tx, clock.clone()),
                clock,
                sighting_rx: Mutex::new(Some(rx)),
                outbox: Mutex::new(VecDeque::new()),
                dispatch_token: Mutex::new(()),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------------

    /// Register a consumer.
    ///
    /// Starts the radio (or widens it to the merged filters and mode) before
    /// the client is recorded; a radio refusal is reported to `sink` through
    /// `on_scan_failed`, returned as `RadioStartFailure`, and leaves the engine
    /// exactly as it was. Cached sightings matching the filters are replayed
    /// as FIRST_MATCH.
    pub fn register_client(
        &self,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
        sink: Arc<dyn ScanSink>,
    ) -> Result<ClientId, ScanError> {
        let target = SinkTarget::new(sink);
        let mut state = self.inner.state.lock();
        let id = state.registry.next_id();

        let mode = DutyCycleScheduler::compute_effective_mode(
            state.registry.max_mode().into_iter().chain(iter::once(settings.mode)),
        )
        .unwrap_or(settings.mode);
        let request = RadioRequest {
            filters: merge_filter_sets(
                state.registry.filter_sets().chain(iter::once(filters.as_slice())),
            ),
            mode,
            active: Duration::from_millis(state.scheduler.timing_for(Some(mode)).active_ms),
        };

        let was_running = state.radio_running;
        let started = if was_running {
            self.inner.backend.reconfigure(&request, &self.inner.sink)
        } else {
            self.inner.backend.start(&request, &self.inner.sink)
        };
        if let Err(e) = started {
            error!("Radio start failed while registering {}: {}", id, e);
            self.enqueue_locked(&state, vec![Delivery::new(id, target, ScanEvent::ScanFailed(e.clone()))]);
            drop(state);
            self.flush_deliveries();
            return Err(ScanError::RadioStartFailure(e));
        }

        state.registry.insert(id, filters, settings, target);
        let mode_changed = state.scheduler.apply_mode(Some(mode));
        state.radio_running = true;
        info!("Registered {} ({:?}, policy {:#05b})", id, settings.mode, settings.policy.bits());

        let cached = self.inner.cache.matching(&[]);
        let replay = state.registry.plan_replay(id, &cached);
        if !replay.is_empty() {
            debug!("Replaying {} cached sightings to {}", replay.len(), id);
        }
        self.enqueue_locked(&state, replay);

        if !state.cycle_in_flight {
            if !was_running {
                self.arm_locked(&mut state, Duration::ZERO);
            } else if mode_changed {
                let idle = Duration::from_millis(state.scheduler.scan_idle_millis());
                self.arm_locked(&mut state, idle);
            }
        }
        drop(state);

        self.flush_deliveries();
        Ok(id)
    }

    /// Remove a consumer.
    ///
    /// Callbacks still queued for it are dropped. One already running on
    /// another thread when this is called may still finish afterwards.
    ///
    /// The last client out stops the radio and cancels the pending wake.
    pub fn unregister_client(&self, id: ClientId) -> Result<(), ScanError> {
        let mut state = self.inner.state.lock();
        if state.registry.remove(id).is_none() {
            return Err(ScanError::UnknownClient(id));
        }
        info!("Unregistered {}", id);

        if state.registry.is_empty() {
            self.inner.backend.stop();
            state.scheduler.disarm();
            state.scheduler.apply_mode(None);
            state.radio_running = false;
            info!("Last client gone, radio stopped");
            return Ok(());
        }

        let mode = state.registry.max_mode();
        state.scheduler.apply_mode(mode);
        let failed = self.reconfigure_locked(&mut state);
        self.enqueue_locked(&state, failed);
        drop(state);

        self.flush_deliveries();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Radio and cycle events
    // ------------------------------------------------------------------------

    /// Process one sighting from the radio
    pub fn on_sighting(&self, sighting: Sighting) {
        let now = self.inner.clock.now_nanos();
        let sighting = if sighting.observed_at_nanos > now {
            debug!(
                "Sighting of {} stamped {}ns in the future, clamping to now",
                sighting.address,
                sighting.observed_at_nanos - now
            );
            sighting.restamped(now)
        } else {
            sighting
        };

        {
            let mut state = self.inner.state.lock();
            let stored = self.inner.cache.upsert(sighting);
            let deliveries = state.registry.plan_sighting(&stored);
            self.enqueue_locked(&state, deliveries);
        }
        self.flush_deliveries();
    }

    /// Close a duty cycle: evict stale sightings, report losses, heartbeat,
    /// and arm the next cycle while any client remains.
    pub fn on_cycle_complete(&self) {
        // sightings still queued belong to the window that just closed
        self.drain_pending_sightings();

        let now = self.inner.clock.now_nanos();
        {
            let mut state = self.inner.state.lock();
            let cutoff = state.scheduler.lost_cutoff_nanos(now);
            let evicted = self.inner.cache.evict_stale(cutoff);
            if !evicted.is_empty() {
                debug!("Evicted {} stale sightings", evicted.len());
            }
            let lost = state.registry.plan_lost(&evicted);
            let beats = state.registry.plan_cycle_complete();
            state.cycle_in_flight = false;

            if !state.registry.is_empty() {
                let idle = Duration::from_millis(state.scheduler.scan_idle_millis());
                self.arm_locked(&mut state, idle);
            }
            self.enqueue_locked(&state, lost);
            self.enqueue_locked(&state, beats);
        }
        debug!("Scan cycle complete");

        self.flush_deliveries();
    }

    /// Wake entry point: run one active window then complete the cycle
    fn run_cycle(&self, generation: u64) {
        let (active, mode) = {
            let mut state = self.inner.state.lock();
            if !state.scheduler.accept_fire(generation) {
                return;
            }
            if state.registry.is_empty() {
                debug!("Wake fired with no clients, ignoring");
                return;
            }
            if state.cycle_in_flight {
                debug!("Cycle already in flight, ignoring wake");
                return;
            }
            state.cycle_in_flight = true;
            (
                Duration::from_millis(state.scheduler.scan_active_millis()),
                state.scheduler.mode().unwrap_or_default(),
            )
        };

        debug!("Scan cycle started ({:?} active)", active);
        let window = self
            .inner
            .backend
            .run_active_window(active, mode, self.inner.clock.as_ref(), &self.inner.sink);
        match window {
            Ok(()) => self.on_cycle_complete(),
            Err(e) => self.fail_session(e),
        }
    }

    /// The radio refused a scan window. Every client is told, the radio stays
    /// off and no further cycle is armed until the next registration.
    fn fail_session(&self, reason: RadioError) {
        {
            let mut state = self.inner.state.lock();
            error!("Radio refused a scan window, stopping the session: {}", reason);
            self.inner.backend.stop();
            state.scheduler.disarm();
            state.radio_running = false;
            state.cycle_in_flight = false;
            let failed = state.registry.plan_scan_failed(&reason);
            self.enqueue_locked(&state, failed);
        }
        self.flush_deliveries();
    }

    // ------------------------------------------------------------------------
    // Queries and overrides
    // ------------------------------------------------------------------------

    /// Cached sightings matching `filters` (empty = all)
    pub fn get_matching_recent(&self, filters: &[ScanFilter]) -> Vec<Sighting> {
        self.inner
            .cache
            .matching(filters)
            .into_iter()
            .map(|s| (*s).clone())
            .collect()
    }

    pub fn effective_mode(&self) -> Option<PowerMode> {
        self.inner.state.lock().scheduler.mode()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn client_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Replace or clear the full timing override.
    ///
    /// An active window of zero pauses the radio while keeping the cycle
    /// running, so staleness eviction and heartbeats continue.
    pub fn set_custom_scan_timing(&self, timing: Option<CycleTiming>) -> Result<(), ScanError> {
        if let Some(custom) = timing {
            if custom.idle_ms == 0 {
                return Err(ConfigError::InvalidTiming {
                    mode: "custom".to_string(),
                    reason: "idle time must be > 0".to_string(),
                }
                .into());
            }
        }

        let mut state = self.inner.state.lock();
        state.scheduler.set_custom_timing(timing);
        info!("Custom scan timing: {:?}", timing);
        if !state.radio_running {
            return Ok(());
        }

        let failed = self.reconfigure_locked(&mut state);
        if !state.cycle_in_flight {
            let idle = Duration::from_millis(state.scheduler.scan_idle_millis());
            self.arm_locked(&mut state, idle);
        }
        self.enqueue_locked(&state, failed);
        drop(state);

        self.flush_deliveries();
        Ok(())
    }

    /// Replace or clear the absolute staleness cutoff
    pub fn set_scan_lost_override(&self, lost: Option<Duration>) {
        self.inner.state.lock().scheduler.set_lost_override(lost);
        info!("Scan lost override: {:?}", lost);
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.inner.state.lock();
        let mode = state.scheduler.mode();
        let now = self.inner.clock.now_nanos();
        EngineStatus {
            clients: state.registry.len(),
            cached_sightings: self.inner.cache.len(),
            effective_mode: mode,
            backend: self.inner.backend.kind(),
            radio_running: state.radio_running,
            scanning: self.inner.backend.is_scanning(),
            armed: state.scheduler.armed().is_some(),
            next_wake_in_ms: state
                .scheduler
                .armed()
                .map(|a| a.deadline_nanos.saturating_sub(now) / 1_000_000),
            timing: mode.map(|_| state.scheduler.timing()),
            lost_threshold_ms: state.scheduler.lost_threshold().as_millis() as u64,
        }
    }

    // ------------------------------------------------------------------------
    // Sighting transport
    // ------------------------------------------------------------------------

    /// Sink a platform can deliver raw sightings into
    pub fn sighting_sink(&self) -> SightingSink {
        self.inner.sink.clone()
    }

    /// Move every queued sighting into `on_sighting` on the calling thread.
    ///
    /// Returns 0 once a pump thread owns the channel.
    pub fn drain_pending_sightings(&self) -> usize {
        let batch: Vec<Sighting> = {
            let mut slot = self.inner.sighting_rx.lock();
            let rx = match slot.as_mut() {
                Some(rx) => rx,
                None => return 0,
            };
            let mut batch = Vec::new();
            while let Ok(sighting) = rx.try_recv() {
                batch.push(sighting);
            }
            batch
        };

        let count = batch.len();
        for sighting in batch {
            self.on_sighting(sighting);
        }
        count
    }

    /// Spawn a thread feeding radio sightings into the engine as they arrive.
    ///
    /// The thread holds only a weak reference and exits when the engine is
    /// dropped and the radio has released its sinks.
    pub fn spawn_sighting_pump(&self) -> Result<JoinHandle<()>, ScanError> {
        let mut rx = self
            .inner
            .sighting_rx
            .lock()
            .take()
            .ok_or(ScanError::PumpAlreadyRunning)?;
        let weak = Arc::downgrade(&self.inner);

        thread::Builder::new()
            .name("blescan-sightings".to_string())
            .spawn(move || {
                while let Some(sighting) = rx.blocking_recv() {
                    match weak.upgrade() {
                        Some(inner) => ScanEngine { inner }.on_sighting(sighting),
                        None => break,
                    }
                }
                debug!("Sighting pump stopped");
            })
            .map_err(|e| ScanError::Thread(e.to_string()))
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Queue a planned round behind every round planned before it
    fn enqueue_locked(&self, _state: &MutexGuard<'_, EngineState>, round: Vec<Delivery>) {
        if !round.is_empty() {
            self.inner.outbox.lock().push_back(round);
        }
    }

    /// Deliver queued rounds in order. Only the token holder dispatches; a
    /// call made while another thread (or an outer frame of this one) holds
    /// it returns at once and the holder picks the rounds up.
    fn flush_deliveries(&self) {
        loop {
            let token = match self.inner.dispatch_token.try_lock() {
                Some(token) => token,
                None => return,
            };
            loop {
                let round = self.inner.outbox.lock().pop_front();
                match round {
                    Some(round) => {
                        dispatch(round);
                    }
                    None => break,
                }
            }
            drop(token);
            // a round queued after the last pop but before the token dropped
            if self.inner.outbox.lock().is_empty() {
                return;
            }
        }
    }

    fn arm_locked(&self, state: &mut MutexGuard<'_, EngineState>, delay: Duration) {
        let now = self.inner.clock.now_nanos();
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        state.scheduler.arm(now, delay, move |generation| {
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    ScanEngine { inner }.run_cycle(generation);
                }
            })
        });
    }

    /// Push the current merged filters and timing to the radio.
    /// Returns failure notices for every client when the radio refuses.
    fn reconfigure_locked(&self, state: &mut MutexGuard<'_, EngineState>) -> Vec<Delivery> {
        let mode = state.scheduler.mode().unwrap_or_default();
        let request = RadioRequest {
            filters: state.registry.merged_filters(),
            mode,
            active: Duration::from_millis(state.scheduler.scan_active_millis()),
        };
        match self.inner.backend.reconfigure(&request, &self.inner.sink) {
            Ok(()) => Vec::new(),
            Err(e) => {
                error!("Radio reconfiguration failed: {}", e);
                state.registry.plan_scan_failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RadioCapabilities, RawFilterSpec, RawSighting};
    use crate::clock::{millis_to_nanos, ManualClock};
    use crate::record::ScanRecord;
    use crate::settings::{DeliveryPolicy, MatchKind};
    use crate::wake::ManualWakeFacility;

    #[derive(Default)]
    struct StubRadio {
        refuse: Mutex<Option<RadioError>>,
        begins: Mutex<u32>,
        ends: Mutex<u32>,
        sink: Mutex<Option<SightingSink>>,
    }

    impl RadioPrimitive for StubRadio {
        fn capabilities(&self) -> RadioCapabilities {
            RadioCapabilities::default()
        }

        fn begin_scan(&self, _spec: &RawFilterSpec, sink: SightingSink) -> Result<(), RadioError> {
            if let Some(e) = self.refuse.lock().clone() {
                return Err(e);
            }
            *self.begins.lock() += 1;
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn end_scan(&self) {
            *self.ends.lock() += 1;
            self.sink.lock().take();
        }
    }

    #[derive(Default)]
    struct Events {
        matches: Mutex<Vec<(MatchKind, String)>>,
        failures: Mutex<Vec<RadioError>>,
        cycles: Mutex<u32>,
    }

    impl ScanSink for Events {
        fn on_match(&self, kind: MatchKind, sighting: &Sighting) {
            self.matches.lock().push((kind, sighting.address.clone()));
        }

        fn on_cycle_complete(&self) {
            *self.cycles.lock() += 1;
        }

        fn on_scan_failed(&self, reason: &RadioError) {
            self.failures.lock().push(reason.clone());
        }
    }

    struct Fixture {
        engine: ScanEngine,
        radio: Arc<StubRadio>,
        wake: Arc<ManualWakeFacility>,
        clock: Arc<ManualClock>,
    }

    fn fixture(config: ScanEngineConfig) -> Fixture {
        let radio = Arc::new(StubRadio::default());
        let wake = Arc::new(ManualWakeFacility::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = ScanEngine::with_clock(config, radio.clone(), wake.clone(), clock.clone())
            .expect("valid config");
        Fixture {
            engine,
            radio,
            wake,
            clock,
        }
    }

    fn sighting(address: &str, at_millis: u64) -> Sighting {
        Sighting::new(address, ScanRecord::default(), -60, millis_to_nanos(at_millis))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ScanEngineConfig {
            lost_cycles: 0,
            ..ScanEngineConfig::default()
        };
        let result = ScanEngine::with_clock(
            config,
            Arc::new(StubRadio::default()),
            Arc::new(ManualWakeFacility::new()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(ScanError::InvalidConfig(ConfigError::ZeroLostCycles))));
    }

    #[test]
    fn test_register_starts_radio_and_arms_immediately() {
        let f = fixture(ScanEngineConfig::default());
        let events = Arc::new(Events::default());

        f.engine
            .register_client(Vec::new(), ScanSettings::default(), events.clone())
            .unwrap();

        assert_eq!(*f.radio.begins.lock(), 1);
        assert_eq!(f.wake.pending_delay(), Some(Duration::ZERO));
        let status = f.engine.status();
        assert_eq!(status.clients, 1);
        assert!(status.radio_running);
        assert!(status.armed);
        assert!(status.scanning);
        assert_eq!(status.next_wake_in_ms, Some(0));
        assert_eq!(status.effective_mode, Some(PowerMode::Balanced));
        assert_eq!(status.backend, BackendKind::ContinuousLegacy);
    }

    #[test]
    fn test_start_failure_leaves_engine_untouched() {
        let f = fixture(ScanEngineConfig::default());
        *f.radio.refuse.lock() = Some(RadioError::PermissionDenied);
        let events = Arc::new(Events::default());

        let result = f.engine.register_client(Vec::new(), ScanSettings::default(), events.clone());

        assert_eq!(result, Err(ScanError::RadioStartFailure(RadioError::PermissionDenied)));
        assert_eq!(*events.failures.lock(), vec![RadioError::PermissionDenied]);
        assert_eq!(f.engine.client_count(), 0);
        assert_eq!(f.engine.effective_mode(), None);
        assert!(!f.engine.status().armed);
    }

    #[test]
    fn test_unregister_unknown_client() {
        let f = fixture(ScanEngineConfig::default());
        let events = Arc::new(Events::default());
        let id = f
            .engine
            .register_client(Vec::new(), ScanSettings::default(), events)
            .unwrap();

        f.engine.unregister_client(id).unwrap();
        assert_eq!(f.engine.unregister_client(id), Err(ScanError::UnknownClient(id)));
    }

    #[test]
    fn test_last_unregister_stops_radio_and_disarms() {
        let f = fixture(ScanEngineConfig::default());
        let id = f
            .engine
            .register_client(Vec::new(), ScanSettings::default(), Arc::new(Events::default()))
            .unwrap();

        f.engine.unregister_client(id).unwrap();

        assert_eq!(*f.radio.ends.lock(), 1);
        assert!(f.wake.pending_delay().is_none());
        let status = f.engine.status();
        assert!(!status.radio_running);
        assert_eq!(status.effective_mode, None);
    }

    #[test]
    fn test_future_timestamp_clamped_to_now() {
        let f = fixture(ScanEngineConfig::default());
        f.engine.on_sighting(sighting("AA:BB:CC:DD:EE:FF", 50_000));

        let cached = f.engine.get_matching_recent(&[]);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].observed_at_nanos, f.clock.now_nanos());
    }

    #[test]
    fn test_cycle_runs_window_and_rearms_with_idle() {
        let f = fixture(ScanEngineConfig::default());
        let events = Arc::new(Events::default());
        f.engine
            .register_client(Vec::new(), ScanSettings::default(), events.clone())
            .unwrap();
        let start = f.clock.now_millis();

        assert!(f.wake.fire());

        // ManualClock::sleep advanced time by the active window
        assert_eq!(f.clock.now_millis(), start + 1_500);
        assert_eq!(*events.cycles.lock(), 1);
        assert_eq!(f.wake.pending_delay(), Some(Duration::from_millis(13_500)));
        assert!(f.radio.sink.lock().is_none());
    }

    #[test]
    fn test_sink_delivery_drained_at_cycle_end() {
        let f = fixture(ScanEngineConfig::default());
        let events = Arc::new(Events::default());
        f.engine
            .register_client(Vec::new(), ScanSettings::default(), events.clone())
            .unwrap();

        let sink = f.radio.sink.lock().clone().expect("window open");
        assert!(sink.deliver(RawSighting::new("11:22:33:44:55:66", vec![0x02, 0x01, 0x06], -40)));
        assert!(events.matches.lock().is_empty());

        f.wake.fire();
        assert_eq!(
            *events.matches.lock(),
            vec![(MatchKind::FirstMatch, "11:22:33:44:55:66".to_string())]
        );
    }

    #[test]
    fn test_pump_can_only_be_spawned_once() {
        let f = fixture(ScanEngineConfig::default());
        let _pump = f.engine.spawn_sighting_pump().unwrap();
        assert!(matches!(f.engine.spawn_sighting_pump(), Err(ScanError::PumpAlreadyRunning)));
        assert_eq!(f.engine.drain_pending_sightings(), 0);
    }

    #[test]
    fn test_custom_timing_validation_and_rearm() {
        let f = fixture(ScanEngineConfig::default());
        assert!(matches!(
            f.engine.set_custom_scan_timing(Some(CycleTiming::new(100, 0))),
            Err(ScanError::InvalidConfig(_))
        ));

        f.engine
            .register_client(
                Vec::new(),
                ScanSettings::new(PowerMode::LowPower, DeliveryPolicy::FIRST_MATCH),
                Arc::new(Events::default()),
            )
            .unwrap();
        f.wake.fire();
        assert_eq!(f.wake.pending_delay(), Some(Duration::from_millis(148_500)));

        f.engine
            .set_custom_scan_timing(Some(CycleTiming::new(200, 800)))
            .unwrap();
        assert_eq!(f.wake.pending_delay(), Some(Duration::from_millis(800)));
        assert_eq!(f.engine.status().timing, Some(CycleTiming::new(200, 800)));
    }

    #[test]
    fn test_status_serializes() {
        let f = fixture(ScanEngineConfig::default().with_lost_override_ms(400));
        let json = serde_json::to_string(&f.engine.status()).unwrap();
        assert!(json.contains("\"lost_threshold_ms\":400"));
        assert!(json.contains("\"effective_mode\":null"));
        assert!(json.contains("\"next_wake_in_ms\":null"));
    }
}
