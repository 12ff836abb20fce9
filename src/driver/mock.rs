//! Mock instrument driver for testing and instrument-free operation.
//!
//! Provides a simulated vendor driver with:
//! - Simulated connect latency
//! - Controllable per-step failure injection
//! - A live-handle counter for resource-leak verification
//! - A deterministic synthetic scan generator driven by acquisition state

use super::{
    HandlerId, InstrumentApi, InstrumentHandle, RawScan, ScanContainerHandle, ScanHandler,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

/// Acquisition-sequence step at which an injected failure fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    /// `start_online_access`
    OnlineAccess,
    /// `instrument(index)`
    Instrument,
    /// `scan_container(index)`
    ScanContainer,
    /// `add_scan_handler`
    Subscribe,
    /// `start_acquisition`
    StartAcquisition,
    /// `InstrumentHandle::release`
    Release,
}

struct MockShared {
    online: AtomicBool,
    acquiring: AtomicBool,
    live_handles: AtomicUsize,
    fail_at: Mutex<Option<FailPoint>>,
    latency: Mutex<Duration>,
    handlers: Mutex<HashMap<u64, ScanHandler>>,
    next_handler_id: AtomicU64,
    scan_counter: AtomicU64,
    generator: Mutex<Option<JoinHandle<()>>>,
    call_log: Mutex<Vec<String>>,
}

impl MockShared {
    /// Consume a pending injected failure if it targets `point`.
    fn check_failure(&self, point: FailPoint) -> bool {
        let mut fail_at = self.fail_at.lock().unwrap();
        if *fail_at == Some(point) {
            *fail_at = None;
            return true;
        }
        false
    }

    fn log_call(&self, call: &str) {
        self.call_log.lock().unwrap().push(call.to_string());
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn invoke_handlers(&self, scan: &RawScan) {
        let handlers: Vec<ScanHandler> = self.handlers.lock().unwrap().values().cloned().collect();
        for handler in &handlers {
            handler(scan.clone());
        }
    }

    fn stop_generator(&self) {
        self.acquiring.store(false, Ordering::SeqCst);
        if let Some(task) = self.generator.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Mock driver container.
///
/// # Example
///
/// ```
/// use scanbridge::driver::{FailPoint, MockInstrumentApi};
/// use std::time::Duration;
///
/// let api = MockInstrumentApi::new(Duration::from_millis(100), 50);
/// api.inject_failure(FailPoint::ScanContainer);
/// assert_eq!(api.live_handles(), 0);
/// ```
pub struct MockInstrumentApi {
    shared: Arc<MockShared>,
    scan_interval: Duration,
    centroids: usize,
}

impl MockInstrumentApi {
    /// Create a mock driver producing `centroids`-wide synthetic scans every
    /// `scan_interval` while acquisition is active.
    pub fn new(scan_interval: Duration, centroids: usize) -> Self {
        Self {
            shared: Arc::new(MockShared {
                online: AtomicBool::new(false),
                acquiring: AtomicBool::new(false),
                live_handles: AtomicUsize::new(0),
                fail_at: Mutex::new(None),
                latency: Mutex::new(Duration::ZERO),
                handlers: Mutex::new(HashMap::new()),
                next_handler_id: AtomicU64::new(0),
                scan_counter: AtomicU64::new(0),
                generator: Mutex::new(None),
                call_log: Mutex::new(Vec::new()),
            }),
            scan_interval,
            centroids,
        }
    }

    /// Set simulated latency applied to driver calls.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.shared.latency.lock().unwrap() = latency;
        self
    }

    /// Inject a failure for the next operation hitting `point`.
    pub fn inject_failure(&self, point: FailPoint) {
        *self.shared.fail_at.lock().unwrap() = Some(point);
    }

    /// Number of currently allocated (unreleased) driver handles.
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    /// Number of installed scan handlers.
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().unwrap().len()
    }

    /// True while online access is established.
    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    /// True while an acquisition run is active.
    pub fn is_acquiring(&self) -> bool {
        self.shared.acquiring.load(Ordering::SeqCst)
    }

    /// Deliver a scan to all installed handlers, bypassing the generator.
    pub fn emit_scan(&self, scan: RawScan) {
        self.shared.invoke_handlers(&scan);
    }

    /// Ordered log of driver calls, for test verification.
    pub fn call_log(&self) -> Vec<String> {
        self.shared.call_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl InstrumentApi for MockInstrumentApi {
    async fn start_online_access(&self) -> Result<()> {
        self.shared.simulate_latency().await;
        self.shared.log_call("start_online_access");
        if self.shared.check_failure(FailPoint::OnlineAccess) {
            bail!("injected failure: online access");
        }
        self.shared.online.store(true, Ordering::SeqCst);
        debug!("mock driver online access started");
        Ok(())
    }

    async fn stop_online_access(&self) -> Result<()> {
        self.shared.log_call("stop_online_access");
        self.shared.online.store(false, Ordering::SeqCst);
        debug!("mock driver online access stopped");
        Ok(())
    }

    async fn instrument(&self, index: u32) -> Result<Arc<dyn InstrumentHandle>> {
        self.shared.simulate_latency().await;
        self.shared.log_call("instrument");
        if self.shared.check_failure(FailPoint::Instrument) {
            bail!("injected failure: instrument acquisition");
        }
        if !self.shared.online.load(Ordering::SeqCst) {
            bail!("online access not started");
        }
        if index != 0 {
            bail!("no instrument at index {index}");
        }
        self.shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockInstrumentHandle {
            shared: self.shared.clone(),
            scan_interval: self.scan_interval,
            centroids: self.centroids,
            released: AtomicBool::new(false),
        }))
    }
}

struct MockInstrumentHandle {
    shared: Arc<MockShared>,
    scan_interval: Duration,
    centroids: usize,
    released: AtomicBool,
}

#[async_trait]
impl InstrumentHandle for MockInstrumentHandle {
    async fn scan_container(&self, index: u32) -> Result<Arc<dyn ScanContainerHandle>> {
        self.shared.simulate_latency().await;
        self.shared.log_call("scan_container");
        if self.shared.check_failure(FailPoint::ScanContainer) {
            bail!("injected failure: scan container acquisition");
        }
        if index != 0 {
            bail!("no scan container at index {index}");
        }
        self.shared.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockScanContainer {
            shared: self.shared.clone(),
            released: AtomicBool::new(false),
        }))
    }

    async fn start_acquisition(&self) -> Result<()> {
        self.shared.log_call("start_acquisition");
        if self.shared.check_failure(FailPoint::StartAcquisition) {
            bail!("injected failure: start acquisition");
        }
        if !self.shared.online.load(Ordering::SeqCst) {
            bail!("online access not started");
        }
        if self.shared.acquiring.swap(true, Ordering::SeqCst) {
            bail!("acquisition already active");
        }

        let shared = self.shared.clone();
        let scan_interval = self.scan_interval;
        let centroids = self.centroids;
        let task = tokio::spawn(async move {
            let mut ticker = interval(scan_interval);
            loop {
                ticker.tick().await;
                if !shared.acquiring.load(Ordering::SeqCst) {
                    break;
                }
                let seq = shared.scan_counter.fetch_add(1, Ordering::SeqCst) + 1;
                let scan = synth_scan(seq, centroids);
                shared.invoke_handlers(&scan);
            }
        });
        *self.shared.generator.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        self.shared.log_call("stop_acquisition");
        if !self.shared.acquiring.load(Ordering::SeqCst) {
            bail!("no acquisition active");
        }
        self.shared.stop_generator();
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.shared.log_call("release_instrument");
        if self.shared.check_failure(FailPoint::Release) {
            bail!("injected failure: instrument release");
        }
        if !self.released.swap(true, Ordering::SeqCst) {
            self.shared.stop_generator();
            self.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockScanContainer {
    shared: Arc<MockShared>,
    released: AtomicBool,
}

#[async_trait]
impl ScanContainerHandle for MockScanContainer {
    async fn add_scan_handler(&self, handler: ScanHandler) -> Result<HandlerId> {
        self.shared.simulate_latency().await;
        self.shared.log_call("add_scan_handler");
        if self.shared.check_failure(FailPoint::Subscribe) {
            bail!("injected failure: scan subscription");
        }
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.shared.handlers.lock().unwrap().insert(id, handler);
        Ok(HandlerId(id))
    }

    async fn remove_scan_handler(&self, id: HandlerId) -> Result<()> {
        self.shared.simulate_latency().await;
        self.shared.log_call("remove_scan_handler");
        self.shared.handlers.lock().unwrap().remove(&id.0);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.shared.log_call("release_container");
        if !self.released.swap(true, Ordering::SeqCst) {
            self.shared.handlers.lock().unwrap().clear();
            self.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Deterministic synthetic spectrum for scan `seq`.
///
/// Sine-derived pseudo-noise instead of `rand`, so the generator stays `Send`
/// and test assertions are reproducible.
fn synth_scan(seq: u64, centroids: usize) -> RawScan {
    let phase = seq as f64 * 0.1;
    let span = 900.0 / centroids.max(1) as f64;
    let mut masses = Vec::with_capacity(centroids);
    let mut intensities = Vec::with_capacity(centroids);
    for i in 0..centroids {
        let x = i as f64;
        let envelope = (phase + x * 0.13).sin().abs();
        let noise = ((phase + x) * 37.0).sin() * 0.05;
        masses.push(100.0 + x * span);
        intensities.push((envelope + noise).max(0.0) * 1000.0);
    }
    RawScan { masses, intensities }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> MockInstrumentApi {
        MockInstrumentApi::new(Duration::from_millis(10), 20)
    }

    #[tokio::test]
    async fn test_full_acquisition_sequence() {
        let api = api();
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        let container = instrument.scan_container(0).await.unwrap();
        assert_eq!(api.live_handles(), 2);

        container.release().await.unwrap();
        instrument.release().await.unwrap();
        api.stop_online_access().await.unwrap();
        assert_eq!(api.live_handles(), 0);
        assert!(!api.is_online());
    }

    #[tokio::test]
    async fn test_instrument_requires_online_access() {
        let api = api();
        assert!(api.instrument(0).await.is_err());
    }

    #[tokio::test]
    async fn test_single_instrument_index() {
        let api = api();
        api.start_online_access().await.unwrap();
        assert!(api.instrument(1).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let api = api();
        api.inject_failure(FailPoint::OnlineAccess);
        assert!(api.start_online_access().await.is_err());
        assert!(api.start_online_access().await.is_ok());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let api = api();
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        assert_eq!(api.live_handles(), 1);
        instrument.release().await.unwrap();
        instrument.release().await.unwrap();
        assert_eq!(api.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_handler_add_remove() {
        let api = api();
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        let container = instrument.scan_container(0).await.unwrap();

        let id = container.add_scan_handler(Arc::new(|_| {})).await.unwrap();
        assert_eq!(api.handler_count(), 1);
        container.remove_scan_handler(id).await.unwrap();
        assert_eq!(api.handler_count(), 0);
        // Removing again is a no-op.
        container.remove_scan_handler(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_scan_reaches_handlers() {
        let api = api();
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        let container = instrument.scan_container(0).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        container
            .add_scan_handler(Arc::new(move |scan| {
                sink.lock().unwrap().push(scan);
            }))
            .await
            .unwrap();

        api.emit_scan(RawScan {
            masses: vec![100.0],
            intensities: vec![1.0],
        });
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generator_produces_scans() {
        let api = MockInstrumentApi::new(Duration::from_millis(5), 10);
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        let container = instrument.scan_container(0).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        container
            .add_scan_handler(Arc::new(move |scan| {
                sink.lock().unwrap().push(scan);
            }))
            .await
            .unwrap();

        instrument.start_acquisition().await.unwrap();
        assert!(api.is_acquiring());
        tokio::time::sleep(Duration::from_millis(30)).await;
        instrument.stop_acquisition().await.unwrap();
        assert!(!api.is_acquiring());

        let scans = received.lock().unwrap();
        assert!(!scans.is_empty());
        let first = &scans[0];
        assert_eq!(first.masses.len(), 10);
        assert_eq!(first.masses.len(), first.intensities.len());
    }

    #[tokio::test]
    async fn test_double_start_acquisition_rejected() {
        let api = api();
        api.start_online_access().await.unwrap();
        let instrument = api.instrument(0).await.unwrap();
        instrument.start_acquisition().await.unwrap();
        assert!(instrument.start_acquisition().await.is_err());
        instrument.stop_acquisition().await.unwrap();
    }

    #[test]
    fn test_synth_scan_is_deterministic() {
        let a = synth_scan(3, 50);
        let b = synth_scan(3, 50);
        assert_eq!(a, b);
        assert!(a.intensities.iter().all(|&i| i >= 0.0));
    }
}
