// Periodic-wake facilities
//
// The engine never owns a timer. It asks a `WakeFacility` to call it back
// after the idle period; delivery may be late, and on some hosts a wake can be
// redelivered or lost across restarts. Only one wake is pending at a time:
// arming again replaces it.

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Callback run when a wake fires
pub type WakeCallback = Box<dyn FnOnce() + Send + 'static>;

/// Clock + alarm abstraction consumed by the scheduler.
///
/// `arm` must not run `on_fire` synchronously: the engine arms while holding
/// its lock, and the callback takes that lock again.
pub trait WakeFacility: Send + Sync {
    /// Schedule `on_fire` after `after`, replacing any pending wake
    fn arm(&self, after: Duration, on_fire: WakeCallback);

    /// Drop the pending wake, if any
    fn cancel(&self);
}

// ============================================================================
// THREAD WAKE FACILITY
// ============================================================================

struct PendingWake {
    deadline: Instant,
    callback: WakeCallback,
}

#[derive(Default)]
struct WakeSlot {
    pending: Option<PendingWake>,
    shutdown: bool,
}

#[derive(Default)]
struct WakeShared {
    slot: Mutex<WakeSlot>,
    cond: Condvar,
}

/// Wake facility backed by a dedicated worker thread.
///
/// Callbacks run on that thread, which therefore doubles as the cycle-tick
/// thread that holds active scan windows open.
pub struct ThreadWakeFacility {
    shared: Arc<WakeShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadWakeFacility {
    /// Spawn the worker thread
    pub fn spawn() -> std::io::Result<Self> {
        let shared = Arc::new(WakeShared::default());
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("blescan-cycle".to_string())
            .spawn(move || run_worker(worker_shared))?;
        let worker_id = handle.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }
}

fn run_worker(shared: Arc<WakeShared>) {
    let mut slot = shared.slot.lock();
    loop {
        if slot.shutdown {
            break;
        }
        let deadline = match &slot.pending {
            None => {
                shared.cond.wait(&mut slot);
                continue;
            }
            Some(pending) => pending.deadline,
        };
        if Instant::now() < deadline {
            shared.cond.wait_until(&mut slot, deadline);
            continue;
        }

        let due = slot.pending.take();
        if let Some(due) = due {
            // Run without the slot lock so the callback can re-arm.
            let outcome = parking_lot::MutexGuard::unlocked(&mut slot, || {
                catch_unwind(AssertUnwindSafe(due.callback))
            });
            if outcome.is_err() {
                warn!("Scan wake callback panicked");
            }
        }
    }
    debug!("Cycle worker thread exiting");
}

impl WakeFacility for ThreadWakeFacility {
    fn arm(&self, after: Duration, on_fire: WakeCallback) {
        let mut slot = self.shared.slot.lock();
        slot.pending = Some(PendingWake {
            deadline: Instant::now() + after,
            callback: on_fire,
        });
        self.shared.cond.notify_one();
    }

    fn cancel(&self) {
        self.shared.slot.lock().pending = None;
        self.shared.cond.notify_one();
    }
}

impl Drop for ThreadWakeFacility {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock();
            slot.shutdown = true;
            slot.pending = None;
        }
        self.shared.cond.notify_all();

        // The last owner may be a callback running on the worker itself.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// MANUAL WAKE FACILITY
// ============================================================================

struct ManualSlot {
    pending: Option<(Duration, WakeCallback)>,
    arm_count: u64,
}

/// Host-driven wake facility.
///
/// Records the pending wake; the host (an OS alarm receiver, a test) calls
/// `fire` when it decides the wake is due.
pub struct ManualWakeFacility {
    slot: Mutex<ManualSlot>,
}

impl ManualWakeFacility {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(ManualSlot {
                pending: None,
                arm_count: 0,
            }),
        }
    }

    /// Run the pending wake. Returns false when nothing was armed.
    pub fn fire(&self) -> bool {
        let pending = self.slot.lock().pending.take();
        match pending {
            Some((_, callback)) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Delay requested by the pending wake
    pub fn pending_delay(&self) -> Option<Duration> {
        self.slot.lock().pending.as_ref().map(|(delay, _)| *delay)
    }

    /// Number of times `arm` has been called
    pub fn arm_count(&self) -> u64 {
        self.slot.lock().arm_count
    }
}

impl Default for ManualWakeFacility {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeFacility for ManualWakeFacility {
    fn arm(&self, after: Duration, on_fire: WakeCallback) {
        let mut slot = self.slot.lock();
        slot.pending = Some((after, on_fire));
        slot.arm_count += 1;
    }

    fn cancel(&self) {
        self.slot.lock().pending = None;
    }
}
