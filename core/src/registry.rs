/// Client registry and dispatch policy
///
/// Tracks every registered consumer with its filters, settings and the set of
/// addresses it has currently "seen". Each (address, client) pair runs a small
/// state machine:
///
/// - `UNSEEN → SEEN` on the first matching sighting (FIRST_MATCH)
/// - `SEEN → SEEN` on later sightings (ALL_MATCHES, if requested)
/// - `SEEN → UNSEEN` on staleness eviction (MATCH_LOST, if requested)
///
/// The registry never calls a sink itself. It plans `Delivery` values while the
/// engine holds its lock; `dispatch` runs them after the lock is released.

use crate::backend::RadioError;
use crate::filter::{matches_any, ScanFilter};
use crate::settings::{MatchKind, PowerMode, ScanSettings};
use crate::sighting::Sighting;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

// ============================================================================
// CONSUMER SINK
// ============================================================================

/// Callback interface implemented by consumers of scan results.
///
/// Callbacks arrive one at a time, in the order the engine planned them, on
/// whichever engine thread is draining deliveries (radio pump, cycle tick, or
/// a caller of the engine). They never run under the engine lock, so a sink
/// may call back into the engine.
pub trait ScanSink: Send + Sync {
    /// A sighting matched this consumer's filters
    fn on_match(&self, kind: MatchKind, sighting: &Sighting);

    /// A duty cycle finished
    fn on_cycle_complete(&self) {}

    /// The radio refused to scan for this consumer
    fn on_scan_failed(&self, reason: &RadioError) {
        let _ = reason;
    }
}

/// Opaque handle identifying a registered client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Sink plus the liveness flag cleared on unregistration
#[derive(Clone)]
pub struct SinkTarget {
    sink: Arc<dyn ScanSink>,
    active: Arc<AtomicBool>,
}

impl SinkTarget {
    pub fn new(sink: Arc<dyn ScanSink>) -> Self {
        Self {
            sink,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

// ============================================================================
// EVENTS & DELIVERY
// ============================================================================

/// Event destined for one consumer
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Match { kind: MatchKind, sighting: Arc<Sighting> },
    CycleComplete,
    ScanFailed(RadioError),
}

/// A planned callback invocation
pub struct Delivery {
    pub client: ClientId,
    pub event: ScanEvent,
    target: SinkTarget,
}

impl Delivery {
    pub fn new(client: ClientId, target: SinkTarget, event: ScanEvent) -> Self {
        Self { client, event, target }
    }
}

/// Invoke planned deliveries.
///
/// A panicking sink is logged and skipped; the rest of the round still runs.
/// Deliveries to clients unregistered after planning are dropped.
pub fn dispatch(deliveries: Vec<Delivery>) -> usize {
    let mut delivered = 0;
    for delivery in deliveries {
        if !delivery.target.is_active() {
            continue;
        }
        let sink = &delivery.target.sink;
        let outcome = catch_unwind(AssertUnwindSafe(|| match &delivery.event {
            ScanEvent::Match { kind, sighting } => sink.on_match(*kind, sighting),
            ScanEvent::CycleComplete => sink.on_cycle_complete(),
            ScanEvent::ScanFailed(reason) => sink.on_scan_failed(reason),
        }));
        match outcome {
            Ok(()) => delivered += 1,
            Err(_) => warn!(
                "Consumer callback for {} panicked while handling {:?}",
                delivery.client,
                event_name(&delivery.event)
            ),
        }
    }
    delivered
}

fn event_name(event: &ScanEvent) -> &'static str {
    match event {
        ScanEvent::Match { kind: MatchKind::FirstMatch, .. } => "FIRST_MATCH",
        ScanEvent::Match { kind: MatchKind::AllMatches, .. } => "ALL_MATCHES",
        ScanEvent::Match { kind: MatchKind::MatchLost, .. } => "MATCH_LOST",
        ScanEvent::CycleComplete => "CYCLE_COMPLETE",
        ScanEvent::ScanFailed(_) => "SCAN_FAILED",
    }
}

// ============================================================================
// CLIENT REGISTRY
// ============================================================================

/// Union of several OR-combined filter sets.
///
/// Any empty set wants everything, which makes the union empty (unfiltered).
pub fn merge_filter_sets<'a, I>(sets: I) -> Vec<ScanFilter>
where
    I: IntoIterator<Item = &'a [ScanFilter]>,
{
    let mut merged: Vec<ScanFilter> = Vec::new();
    for set in sets {
        if set.is_empty() {
            return Vec::new();
        }
        for filter in set {
            if !merged.contains(filter) {
                merged.push(filter.clone());
            }
        }
    }
    merged
}

/// A registered consumer
pub struct Client {
    pub id: ClientId,
    pub filters: Vec<ScanFilter>,
    pub settings: ScanSettings,
    seen: HashSet<String>,
    target: SinkTarget,
}

/// Registered consumers keyed by handle
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
    next_id: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the handle the next inserted client will use
    pub fn next_id(&mut self) -> ClientId {
        self.next_id += 1;
        ClientId(self.next_id)
    }

    /// Add a client with an empty seen set
    pub fn insert(
        &mut self,
        id: ClientId,
        filters: Vec<ScanFilter>,
        settings: ScanSettings,
        target: SinkTarget,
    ) {
        self.clients.insert(
            id,
            Client {
                id,
                filters,
                settings,
                seen: HashSet::new(),
                target,
            },
        );
    }

    /// Remove a client; it receives nothing further, even from planned rounds
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        client.target.deactivate();
        Some(client)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Highest-priority mode across clients, or `None` when empty
    pub fn max_mode(&self) -> Option<PowerMode> {
        self.clients.values().map(|c| c.settings.mode).max()
    }

    /// Filter set of every client
    pub fn filter_sets(&self) -> impl Iterator<Item = &[ScanFilter]> + '_ {
        self.clients.values().map(|c| c.filters.as_slice())
    }

    /// Union of all client filters
    pub fn merged_filters(&self) -> Vec<ScanFilter> {
        merge_filter_sets(self.filter_sets())
    }

    /// Plan callbacks for a fresh sighting and advance seen state
    pub fn plan_sighting(&mut self, sighting: &Arc<Sighting>) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for client in self.clients.values_mut() {
            if !matches_any(&client.filters, sighting) {
                continue;
            }
            let policy = client.settings.policy;
            let first_time = client.seen.insert(sighting.address.clone());

            let kind = if first_time && policy.wants_matches() {
                Some(MatchKind::FirstMatch)
            } else if !first_time && policy.contains(MatchKind::AllMatches) {
                Some(MatchKind::AllMatches)
            } else {
                None
            };

            if let Some(kind) = kind {
                deliveries.push(Delivery::new(
                    client.id,
                    client.target.clone(),
                    ScanEvent::Match {
                        kind,
                        sighting: Arc::clone(sighting),
                    },
                ));
            }
        }
        deliveries
    }

    /// Plan FIRST_MATCH replays of cached sightings for a newly added client
    pub fn plan_replay(&mut self, id: ClientId, cached: &[Arc<Sighting>]) -> Vec<Delivery> {
        let client = match self.clients.get_mut(&id) {
            Some(client) => client,
            None => return Vec::new(),
        };
        let mut deliveries = Vec::new();
        for sighting in cached {
            if !matches_any(&client.filters, sighting) {
                continue;
            }
            if client.seen.insert(sighting.address.clone()) && client.settings.policy.wants_matches() {
                deliveries.push(Delivery::new(
                    client.id,
                    client.target.clone(),
                    ScanEvent::Match {
                        kind: MatchKind::FirstMatch,
                        sighting: Arc::clone(sighting),
                    },
                ));
            }
        }
        deliveries
    }

    /// Plan MATCH_LOST callbacks for evicted addresses.
    ///
    /// Every client forgets the address; only those asking for ALL_MATCHES or
    /// MATCH_LOST are told.
    pub fn plan_lost(&mut self, evicted: &[(String, Arc<Sighting>)]) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for (address, last) in evicted {
            for client in self.clients.values_mut() {
                if client.seen.remove(address) && client.settings.policy.wants_lost() {
                    deliveries.push(Delivery::new(
                        client.id,
                        client.target.clone(),
                        ScanEvent::Match {
                            kind: MatchKind::MatchLost,
                            sighting: Arc::clone(last),
                        },
                    ));
                }
            }
        }
        deliveries
    }

    /// Plan a cycle-complete heartbeat for every client
    pub fn plan_cycle_complete(&self) -> Vec<Delivery> {
        self.clients
            .values()
            .map(|c| Delivery::new(c.id, c.target.clone(), ScanEvent::CycleComplete))
            .collect()
    }

    /// Plan a scan failure notification for every client
    pub fn plan_scan_failed(&self, reason: &RadioError) -> Vec<Delivery> {
        self.clients
            .values()
            .map(|c| Delivery::new(c.id, c.target.clone(), ScanEvent::ScanFailed(reason.clone())))
            .collect()
    }
}
