// Integration test: per-client delivery policy
//
// Drives the engine directly through on_sighting / on_cycle_complete on a
// manual clock and checks which FIRST_MATCH / ALL_MATCHES / MATCH_LOST
// callbacks each consumer gets.

use blescan_core::record::uuid_from_u16;
use blescan_core::{
    Clock, ClientId, DeliveryPolicy, ManualClock, ManualWakeFacility, MatchKind, PowerMode,
    RadioCapabilities, RadioError, RadioPrimitive, RawFilterSpec, ScanEngine, ScanEngineConfig,
    ScanFilter, ScanRecord, ScanSettings, ScanSink, Sighting, SightingSink,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Harness
// ============================================================================

struct QuietRadio;

impl RadioPrimitive for QuietRadio {
    fn capabilities(&self) -> RadioCapabilities {
        RadioCapabilities::default()
    }

    fn begin_scan(&self, _spec: &RawFilterSpec, _sink: SightingSink) -> Result<(), RadioError> {
        Ok(())
    }

    fn end_scan(&self) {}
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(MatchKind, String)>>,
    cycles: Mutex<u32>,
}

impl Recorder {
    fn events(&self) -> Vec<(MatchKind, String)> {
        self.events.lock().clone()
    }
}

impl ScanSink for Recorder {
    fn on_match(&self, kind: MatchKind, sighting: &Sighting) {
        self.events.lock().push((kind, sighting.address.clone()));
    }

    fn on_cycle_complete(&self) {
        *self.cycles.lock() += 1;
    }
}

struct Harness {
    engine: ScanEngine,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(config: ScanEngineConfig) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let clock = Arc::new(ManualClock::new(0));
        let engine = ScanEngine::with_clock(
            config,
            Arc::new(QuietRadio),
            Arc::new(ManualWakeFacility::new()),
            clock.clone(),
        )
        .expect("engine");
        Self { engine, clock }
    }

    fn register(&self, filters: Vec<ScanFilter>, policy: DeliveryPolicy) -> (ClientId, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let id = self
            .engine
            .register_client(filters, ScanSettings::new(PowerMode::Balanced, policy), recorder.clone())
            .expect("register");
        (id, recorder)
    }

    /// Deliver a sighting stamped at the current clock reading
    fn see(&self, address: &str) {
        self.see_payload(address, &[]);
    }

    fn see_payload(&self, address: &str, payload: &[u8]) {
        let at = self.clock.now_nanos();
        self.engine.on_sighting(Sighting::from_raw(address, payload, -60, at));
    }

    fn at_millis(&self, millis: u64) {
        self.clock.set_millis(millis);
    }
}

fn first(address: &str) -> (MatchKind, String) {
    (MatchKind::FirstMatch, address.to_string())
}

fn again(address: &str) -> (MatchKind, String) {
    (MatchKind::AllMatches, address.to_string())
}

fn lost(address: &str) -> (MatchKind, String) {
    (MatchKind::MatchLost, address.to_string())
}

const A: &str = "AA:AA:AA:AA:AA:01";
const B: &str = "BB:BB:BB:BB:BB:02";

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_lost_cutoff_is_strict() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.at_millis(0);
    h.see(A);
    h.at_millis(100);
    h.see(B);

    // cutoff = 450 - 400 = 50ms: A (0ms) is stale, B (100ms) is fresh
    h.at_millis(450);
    h.engine.on_cycle_complete();

    assert_eq!(recorder.events(), vec![first(A), first(B), lost(A)]);
    let cached: Vec<String> = h
        .engine
        .get_matching_recent(&[])
        .into_iter()
        .map(|s| s.address)
        .collect();
    assert_eq!(cached, vec![B.to_string()]);
    assert_eq!(*recorder.cycles.lock(), 1);
}

#[test]
fn test_entry_exactly_at_cutoff_is_kept() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.at_millis(50);
    h.see(A);
    h.at_millis(450);
    h.engine.on_cycle_complete();

    assert_eq!(recorder.events(), vec![first(A)]);
    assert_eq!(h.engine.get_matching_recent(&[]).len(), 1);
}

#[test]
fn test_first_match_only_policy() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::FIRST_MATCH);

    h.see(A);
    h.see(A);
    h.see(A);
    h.at_millis(1_000);
    h.engine.on_cycle_complete();

    assert_eq!(recorder.events(), vec![first(A)]);
}

#[test]
fn test_all_matches_policy() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.see(A);
    h.see(A);
    h.at_millis(1_000);
    h.engine.on_cycle_complete();

    assert_eq!(recorder.events(), vec![first(A), again(A), lost(A)]);
}

#[test]
fn test_lost_only_policy() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::MATCH_LOST);

    h.see(A);
    h.see(A);
    assert!(recorder.events().is_empty());

    h.at_millis(1_000);
    h.engine.on_cycle_complete();
    assert_eq!(recorder.events(), vec![lost(A)]);
}

#[test]
fn test_first_and_lost_policy() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::FIRST_MATCH | DeliveryPolicy::MATCH_LOST);

    h.see(A);
    h.see(A);
    h.at_millis(1_000);
    h.engine.on_cycle_complete();

    assert_eq!(recorder.events(), vec![first(A), lost(A)]);
}

#[test]
fn test_rediscovery_after_loss_is_a_first_match() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.see(A);
    h.at_millis(1_000);
    h.engine.on_cycle_complete();
    h.see(A);

    assert_eq!(recorder.events(), vec![first(A), lost(A), first(A)]);
}

#[test]
fn test_filters_route_sightings_per_client() {
    let h = Harness::new(ScanEngineConfig::default());
    let battery = ScanFilter::builder()
        .service_uuid(uuid_from_u16(0x180F))
        .build()
        .expect("filter");
    let (_, battery_client) = h.register(vec![battery], DeliveryPolicy::ALL_MATCHES);
    let (_, everything) = h.register(Vec::new(), DeliveryPolicy::FIRST_MATCH);

    h.see_payload(A, &[0x03, 0x03, 0x0F, 0x18]);
    h.see_payload(B, &[0x03, 0x03, 0x0D, 0x18]);

    assert_eq!(battery_client.events(), vec![first(A)]);
    assert_eq!(everything.events(), vec![first(A), first(B)]);
}

#[test]
fn test_registration_replays_cached_matches() {
    let h = Harness::new(ScanEngineConfig::default());
    let (_, _early) = h.register(Vec::new(), DeliveryPolicy::FIRST_MATCH);
    h.see(A);
    h.see_payload(B, &[0x05, 0x09, b'T', b'a', b'g', b'2']);

    let named = ScanFilter::builder().device_name("Tag2").build().expect("filter");
    let (_, late) = h.register(vec![named], DeliveryPolicy::ALL_MATCHES);
    assert_eq!(late.events(), vec![first(B)]);

    // already seen through the replay
    h.see_payload(B, &[0x05, 0x09, b'T', b'a', b'g', b'2']);
    assert_eq!(late.events(), vec![first(B), again(B)]);
}

#[test]
fn test_replay_respects_lost_only_policy() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    h.see(A);

    let (_, late) = h.register(Vec::new(), DeliveryPolicy::MATCH_LOST);
    assert!(late.events().is_empty());

    h.at_millis(1_000);
    h.engine.on_cycle_complete();
    assert_eq!(late.events(), vec![lost(A)]);
}

#[test]
fn test_get_matching_recent_returns_every_device() {
    let h = Harness::new(ScanEngineConfig::default());
    for i in 0..64u8 {
        h.see(&format!("10:00:00:00:00:{:02X}", i));
    }
    // repeated sightings keep one entry per device
    h.see("10:00:00:00:00:00");

    assert_eq!(h.engine.get_matching_recent(&[]).len(), 64);

    let one = ScanFilter::builder()
        .device_address("10:00:00:00:00:2a")
        .build()
        .expect("filter");
    let matched = h.engine.get_matching_recent(&[one]);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].address, "10:00:00:00:00:2A");
}

#[test]
fn test_newer_sighting_replaces_cached_one() {
    let h = Harness::new(ScanEngineConfig::default());
    h.at_millis(10);
    h.engine.on_sighting(Sighting::new(A, ScanRecord::default(), -80, 10_000_000));
    h.at_millis(20);
    h.engine.on_sighting(Sighting::new(A, ScanRecord::default(), -40, 20_000_000));

    let cached = h.engine.get_matching_recent(&[]);
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].rssi, -40);
    assert_eq!(cached[0].observed_at_nanos, 20_000_000);
}

// ============================================================================
// Callback isolation and reentrancy
// ============================================================================

struct Exploder;

impl ScanSink for Exploder {
    fn on_match(&self, _kind: MatchKind, _sighting: &Sighting) {
        panic!("consumer bug");
    }
}

#[test]
fn test_panicking_consumer_does_not_starve_others() {
    let h = Harness::new(ScanEngineConfig::default());
    h.engine
        .register_client(Vec::new(), ScanSettings::default(), Arc::new(Exploder))
        .expect("register");
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.see(A);
    h.see(A);

    assert_eq!(recorder.events(), vec![first(A), again(A)]);
    assert_eq!(h.engine.client_count(), 2);
}

/// Unregisters itself from inside its first callback
#[derive(Default)]
struct OneShot {
    engine: Mutex<Option<ScanEngine>>,
    id: Mutex<Option<ClientId>>,
    calls: Mutex<u32>,
}

impl ScanSink for OneShot {
    fn on_match(&self, _kind: MatchKind, _sighting: &Sighting) {
        *self.calls.lock() += 1;
        let engine = self.engine.lock().take();
        let id = *self.id.lock();
        if let (Some(engine), Some(id)) = (engine, id) {
            engine.unregister_client(id).expect("unregister from callback");
        }
    }
}

#[test]
fn test_unregister_from_inside_callback() {
    let h = Harness::new(ScanEngineConfig::default());
    let (_, keeper) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    let one_shot = Arc::new(OneShot::default());
    let id = h
        .engine
        .register_client(
            Vec::new(),
            ScanSettings::new(PowerMode::LowLatency, DeliveryPolicy::ALL_MATCHES),
            one_shot.clone(),
        )
        .expect("register");
    *one_shot.id.lock() = Some(id);
    *one_shot.engine.lock() = Some(h.engine.clone());
    assert_eq!(h.engine.effective_mode(), Some(PowerMode::LowLatency));

    h.see(A);
    h.see(A);
    h.see(B);

    assert_eq!(*one_shot.calls.lock(), 1);
    assert_eq!(h.engine.client_count(), 1);
    assert_eq!(h.engine.effective_mode(), Some(PowerMode::Balanced));
    assert_eq!(keeper.events(), vec![first(A), again(A), first(B)]);
}

#[test]
fn test_scan_lost_override_applies_at_runtime() {
    let h = Harness::new(ScanEngineConfig::default());
    let (_, recorder) = h.register(Vec::new(), DeliveryPolicy::ALL_MATCHES);

    h.see(A);
    h.at_millis(5_000);
    h.engine.on_cycle_complete();
    assert_eq!(recorder.events(), vec![first(A)]);

    h.engine.set_scan_lost_override(Some(Duration::from_secs(1)));
    h.engine.on_cycle_complete();
    assert_eq!(recorder.events(), vec![first(A), lost(A)]);
}

/// On its first MATCH_LOST, re-sights the other device from a second thread
/// and waits for that thread before returning.
struct Resighter {
    events: Mutex<Vec<(MatchKind, String)>>,
    engine: Mutex<Option<ScanEngine>>,
    resighted: Mutex<Option<String>>,
    clock: Arc<ManualClock>,
}

impl ScanSink for Resighter {
    fn on_match(&self, kind: MatchKind, sighting: &Sighting) {
        self.events.lock().push((kind, sighting.address.clone()));
        if kind != MatchKind::MatchLost {
            return;
        }
        let engine = self.engine.lock().take();
        if let Some(engine) = engine {
            let other = if sighting.address == A { B } else { A };
            *self.resighted.lock() = Some(other.to_string());
            let at = self.clock.now_nanos();
            thread::spawn(move || engine.on_sighting(Sighting::from_raw(other, &[], -60, at)))
                .join()
                .expect("resighting thread");
        }
    }
}

#[test]
fn test_loss_and_rediscovery_from_other_thread_keep_order() {
    let h = Harness::new(ScanEngineConfig::default().with_lost_override_ms(400));
    let sink = Arc::new(Resighter {
        events: Mutex::new(Vec::new()),
        engine: Mutex::new(None),
        resighted: Mutex::new(None),
        clock: h.clock.clone(),
    });
    h.engine
        .register_client(
            Vec::new(),
            ScanSettings::new(PowerMode::Balanced, DeliveryPolicy::FIRST_MATCH | DeliveryPolicy::MATCH_LOST),
            sink.clone(),
        )
        .expect("register");
    *sink.engine.lock() = Some(h.engine.clone());

    h.see(A);
    h.see(B);
    h.at_millis(500);
    h.engine.on_cycle_complete();

    let resighted = sink.resighted.lock().clone().expect("a loss was reported");
    let events = sink.events.lock().clone();
    assert_eq!(events.len(), 5, "{:?}", events);
    assert_eq!(events[..2], [first(A), first(B)]);
    assert_eq!(events[2].0, MatchKind::MatchLost);
    assert_eq!(events[3], lost(&resighted));
    // the rediscovery lands after the loss it follows
    assert_eq!(events[4], first(&resighted));

    let cached: Vec<String> = h
        .engine
        .get_matching_recent(&[])
        .into_iter()
        .map(|s| s.address)
        .collect();
    assert_eq!(cached, vec![resighted]);
}
