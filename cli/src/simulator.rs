// Simulated BLE radio
//
// Stands in for a platform scanner so the engine can be exercised without
// hardware. While a scan is running a worker thread advertises every present
// device at a fixed interval with a jittered RSSI.

use blescan_core::{RadioCapabilities, RadioError, RadioPrimitive, RawFilterSpec, RawSighting, SightingSink};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Manufacturer id reserved for testing
const TEST_COMPANY_ID: u16 = 0xFFFF;

/// One simulated advertiser
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub address: String,
    pub name: String,
    /// Whether this device stops advertising when the simulation says so
    pub transient: bool,
}

impl SimDevice {
    /// Advertising payload: flags, complete name, manufacturer data
    pub fn payload(&self, index: u8) -> Vec<u8> {
        let mut payload = vec![0x02, 0x01, 0x06];
        let name = self.name.as_bytes();
        payload.push(name.len() as u8 + 1);
        payload.push(0x09);
        payload.extend_from_slice(name);
        let company = TEST_COMPANY_ID.to_le_bytes();
        payload.extend_from_slice(&[0x04, 0xFF, company[0], company[1], index]);
        payload
    }
}

/// Every odd device is transient
pub fn make_devices(count: usize) -> Vec<SimDevice> {
    (0..count)
        .map(|i| SimDevice {
            address: format!("5E:00:00:00:{:02X}:{:02X}", (i >> 8) & 0xFF, i & 0xFF),
            name: format!("sim-{:02}", i),
            transient: i % 2 == 1,
        })
        .collect()
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct SimulatedRadio {
    devices: Arc<Vec<SimDevice>>,
    interval: Duration,
    offloaded: bool,
    boot: Instant,
    vanished: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl SimulatedRadio {
    pub fn new(devices: Vec<SimDevice>, interval: Duration, offloaded: bool) -> Self {
        Self {
            devices: Arc::new(devices),
            interval,
            offloaded,
            boot: Instant::now(),
            vanished: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Silence every transient device from now on
    pub fn vanish_transient(&self) {
        self.vanished.store(true, Ordering::Release);
    }
}

impl RadioPrimitive for SimulatedRadio {
    fn capabilities(&self) -> RadioCapabilities {
        RadioCapabilities {
            offloaded_filtering: self.offloaded,
        }
    }

    fn begin_scan(&self, spec: &RawFilterSpec, sink: SightingSink) -> Result<(), RadioError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(RadioError::AlreadyScanning);
        }
        debug!("Simulated scan started ({:?}, {} filters)", spec.mode, spec.filters.len());

        let running = Arc::new(AtomicBool::new(true));
        let devices = Arc::clone(&self.devices);
        let vanished = Arc::clone(&self.vanished);
        let flag = Arc::clone(&running);
        let interval = self.interval;
        let offloaded = self.offloaded;
        let boot = self.boot;

        let handle = thread::Builder::new()
            .name("sim-radio".to_string())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                while flag.load(Ordering::Acquire) {
                    let gone = vanished.load(Ordering::Acquire);
                    for (i, device) in devices.iter().enumerate() {
                        if gone && device.transient {
                            continue;
                        }
                        let mut raw =
                            RawSighting::new(device.address.clone(), device.payload(i as u8), rng.gen_range(-90..=-40));
                        if offloaded {
                            raw = raw.with_local_timestamp(boot.elapsed().as_nanos() as u64);
                        }
                        sink.deliver(raw);
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|e| RadioError::Platform(e.to_string()))?;

        *worker = Some(Worker { running, handle });
        Ok(())
    }

    fn end_scan(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.running.store(false, Ordering::Release);
            let _ = worker.handle.join();
            debug!("Simulated scan stopped");
        }
    }

    fn local_clock_nanos(&self) -> Option<u64> {
        Some(self.boot.elapsed().as_nanos() as u64)
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        self.end_scan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blescan_core::ScanRecord;

    #[test]
    fn test_payload_decodes() {
        let devices = make_devices(3);
        let record = ScanRecord::parse(&devices[2].payload(2));
        assert_eq!(record.device_name.as_deref(), Some("sim-02"));
        assert_eq!(record.manufacturer_data_for(TEST_COMPANY_ID), Some(&[2u8][..]));
        assert_eq!(record.advertise_flags, Some(0x06));
    }

    #[test]
    fn test_make_devices_marks_odd_transient() {
        let devices = make_devices(4);
        assert_eq!(devices.len(), 4);
        assert!(!devices[0].transient);
        assert!(devices[1].transient);
        assert_eq!(devices[3].address, "5E:00:00:00:00:03");
    }
}
