//! Instrument connection lifecycle management.
//!
//! [`ConnectionManager`] owns the device handle and drives the four-state
//! lifecycle Disconnected → Connecting → Connected → Disconnecting →
//! Disconnected. Exactly one transition is in flight at a time; the
//! check-and-set happens under a short mutex while the driver calls run
//! outside it, so state reads never wait on hardware I/O.
//!
//! The scan-event subscriber lives here too: on entering Connected a
//! forwarding handler is installed on the driver's scan container, and it is
//! always removed before the device handle is released.

use crate::core::{ConnectionState, ScanEvent, StatusReport};
use crate::distributor::ScanDistributor;
use crate::driver::{
    DriverFactory, HandlerId, InstrumentApi, InstrumentHandle, RawScan, ScanContainerHandle,
    ScanHandler,
};
use crate::error::{AppResult, BridgeError};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Driver resources held while the connection is established.
///
/// Exists iff the state machine is `Connected` or `Disconnecting`.
struct DeviceHandle {
    api: Arc<dyn InstrumentApi>,
    instrument: Arc<dyn InstrumentHandle>,
    container: Arc<dyn ScanContainerHandle>,
    scan_handler: Option<HandlerId>,
}

/// Asynchronous state machine governing one instrument connection.
pub struct ConnectionManager {
    factory: DriverFactory,
    instrument_index: u32,
    distributor: Arc<ScanDistributor>,
    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    connectivity_tx: broadcast::Sender<bool>,
    device: tokio::sync::Mutex<Option<DeviceHandle>>,
    online_access: AtomicBool,
    acquisition_active: AtomicBool,
    scan_counter: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create a manager over `factory`, forwarding scans into `distributor`.
    pub fn new(
        factory: DriverFactory,
        instrument_index: u32,
        distributor: Arc<ScanDistributor>,
    ) -> Arc<Self> {
        let (connectivity_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            factory,
            instrument_index,
            distributor,
            state: Mutex::new(ConnectionState::Disconnected),
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            connectivity_tx,
            device: tokio::sync::Mutex::new(None),
            online_access: AtomicBool::new(false),
            acquisition_active: AtomicBool::new(false),
            scan_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Current state at call time, including transitional states.
    /// Never blocks on an in-flight transition.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel following every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connectivity-changed notifications, emitted in transition order.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<bool> {
        self.connectivity_tx.subscribe()
    }

    /// Status projection for the control surface.
    pub fn status(&self) -> StatusReport {
        let connection_state = self.state();
        StatusReport {
            instrument_connected: connection_state.is_connected(),
            online_access: self.online_access.load(Ordering::SeqCst),
            acquisition_active: self.acquisition_active.load(Ordering::SeqCst),
            connection_state,
        }
    }

    /// Establish the connection.
    ///
    /// No-op when already `Connected` or `Connecting`; rejected with
    /// `InvalidStateTransition` while `Disconnecting`. On any acquisition
    /// failure every handle acquired before the failing step is released
    /// before the state settles back to `Disconnected`.
    pub async fn connect(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnecting => {
                    return Err(BridgeError::InvalidStateTransition {
                        operation: "connect",
                        state: *state,
                    });
                }
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    self.state_tx.send_replace(ConnectionState::Connecting);
                }
            }
        }

        info!("Connecting to instrument...");
        match self.acquire().await {
            Ok(device) => {
                *self.device.lock().await = Some(device);
                self.settle(ConnectionState::Connected, true);
                info!("Instrument connected");
                Ok(())
            }
            Err(err) => {
                self.online_access.store(false, Ordering::SeqCst);
                self.settle(ConnectionState::Disconnected, false);
                error!("Connect failed: {err}");
                Err(err)
            }
        }
    }

    /// Tear the connection down.
    ///
    /// No-op when already `Disconnected` or `Disconnecting`; rejected with
    /// `InvalidStateTransition` while `Connecting`. Teardown failures are
    /// reported as `DisconnectFailed`, but the state always settles to
    /// `Disconnected`.
    pub async fn disconnect(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(BridgeError::InvalidStateTransition {
                        operation: "disconnect",
                        state: *state,
                    });
                }
                ConnectionState::Connected => {
                    *state = ConnectionState::Disconnecting;
                    self.state_tx.send_replace(ConnectionState::Disconnecting);
                }
            }
        }

        info!("Disconnecting from instrument...");
        let device = self.device.lock().await.take();
        let mut teardown_err: Option<anyhow::Error> = None;

        if let Some(mut device) = device {
            // Unsubscribe strictly before releasing the device handle, so no
            // callback can fire into a freed handle.
            if let Some(id) = device.scan_handler.take() {
                if let Err(err) = device.container.remove_scan_handler(id).await {
                    warn!("Removing scan handler failed: {err}");
                    teardown_err.get_or_insert(err.context("removing scan handler"));
                }
            }
            if let Err(err) = device.container.release().await {
                warn!("Releasing scan container failed: {err}");
                teardown_err.get_or_insert(err.context("releasing scan container"));
            }
            if let Err(err) = device.instrument.release().await {
                warn!("Releasing instrument handle failed: {err}");
                teardown_err.get_or_insert(err.context("releasing instrument handle"));
            }
            if let Err(err) = device.api.stop_online_access().await {
                warn!("Stopping online access failed: {err}");
                teardown_err.get_or_insert(err.context("stopping online access"));
            }
        }

        self.online_access.store(false, Ordering::SeqCst);
        self.acquisition_active.store(false, Ordering::SeqCst);
        self.settle(ConnectionState::Disconnected, false);
        info!("Instrument disconnected");

        match teardown_err {
            None => Ok(()),
            Some(err) => Err(BridgeError::DisconnectFailed(err)),
        }
    }

    /// Begin an acquisition run on the connected instrument.
    pub async fn start_acquisition(&self) -> AppResult<()> {
        let instrument = self.connected_instrument().await?;
        instrument
            .start_acquisition()
            .await
            .map_err(BridgeError::Instrument)?;
        self.acquisition_active.store(true, Ordering::SeqCst);
        info!("Acquisition started");
        Ok(())
    }

    /// Cancel the current acquisition run.
    pub async fn stop_acquisition(&self) -> AppResult<()> {
        let instrument = self.connected_instrument().await?;
        instrument
            .stop_acquisition()
            .await
            .map_err(BridgeError::Instrument)?;
        self.acquisition_active.store(false, Ordering::SeqCst);
        info!("Acquisition stopped");
        Ok(())
    }

    /// The acquisition sequence. Runs without holding the state lock; on
    /// failure, handles acquired before the failing step are released in
    /// reverse order.
    async fn acquire(&self) -> AppResult<DeviceHandle> {
        let api = (self.factory)()?;

        api.start_online_access()
            .await
            .map_err(|err| BridgeError::ConnectionFailed(err.context("starting online access")))?;
        self.online_access.store(true, Ordering::SeqCst);

        let instrument = match api.instrument(self.instrument_index).await {
            Ok(instrument) => instrument,
            Err(err) => {
                let _ = api.stop_online_access().await;
                return Err(BridgeError::ConnectionFailed(
                    err.context("acquiring instrument handle"),
                ));
            }
        };

        let container = match instrument.scan_container(0).await {
            Ok(container) => container,
            Err(err) => {
                if let Err(cleanup) = instrument.release().await {
                    warn!("Cleanup release after failed connect: {cleanup}");
                }
                let _ = api.stop_online_access().await;
                return Err(BridgeError::ConnectionFailed(
                    err.context("acquiring scan container"),
                ));
            }
        };

        let scan_handler = match container.add_scan_handler(self.scan_forwarder()).await {
            Ok(id) => id,
            Err(err) => {
                if let Err(cleanup) = container.release().await {
                    warn!("Cleanup release after failed connect: {cleanup}");
                }
                if let Err(cleanup) = instrument.release().await {
                    warn!("Cleanup release after failed connect: {cleanup}");
                }
                let _ = api.stop_online_access().await;
                return Err(BridgeError::ConnectionFailed(
                    err.context("subscribing to scan events"),
                ));
            }
        };

        Ok(DeviceHandle {
            api,
            instrument,
            container,
            scan_handler: Some(scan_handler),
        })
    }

    /// The scan-event subscriber: converts native notifications into
    /// [`ScanEvent`]s and hands them to the distributor. Runs on the
    /// driver's thread; only hands off, never blocks.
    fn scan_forwarder(&self) -> ScanHandler {
        let distributor = self.distributor.clone();
        let counter = self.scan_counter.clone();
        Arc::new(move |raw: RawScan| {
            let event = ScanEvent {
                scan_number: counter.fetch_add(1, Ordering::SeqCst) + 1,
                timestamp: Utc::now(),
                masses: raw.masses,
                intensities: raw.intensities,
            };
            distributor.publish(event);
        })
    }

    async fn connected_instrument(&self) -> AppResult<Arc<dyn InstrumentHandle>> {
        if !self.state().is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let device = self.device.lock().await;
        device
            .as_ref()
            .map(|d| d.instrument.clone())
            .ok_or(BridgeError::NotConnected)
    }

    fn settle(&self, to: ConnectionState, connected: bool) {
        {
            let mut state = self.state.lock().unwrap();
            *state = to;
            self.state_tx.send_replace(to);
        }
        // Ignore errors if no receivers are active.
        let _ = self.connectivity_tx.send(connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::driver::{FailPoint, MockInstrumentApi};
    use std::time::Duration;

    fn harness(
        api: MockInstrumentApi,
    ) -> (Arc<ConnectionManager>, Arc<MockInstrumentApi>, Arc<ScanDistributor>) {
        let api = Arc::new(api);
        let factory: DriverFactory = {
            let api = api.clone();
            Arc::new(move || Ok(api.clone() as Arc<dyn InstrumentApi>))
        };
        let distributor = ScanDistributor::new(&TelemetryConfig {
            throttle_interval: Duration::from_millis(10),
            client_buffer: 8,
        });
        let manager = ConnectionManager::new(factory, 0, distributor.clone());
        (manager, api, distributor)
    }

    fn mock() -> MockInstrumentApi {
        MockInstrumentApi::new(Duration::from_millis(5), 10)
    }

    #[tokio::test]
    async fn test_connect_reaches_connected() {
        let (manager, api, _distributor) = harness(mock());
        let mut connectivity = manager.subscribe_connectivity();

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.status().instrument_connected);
        assert!(manager.status().online_access);
        assert_eq!(api.live_handles(), 2);
        assert_eq!(api.handler_count(), 1);
        assert!(connectivity.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let (manager, api, _distributor) = harness(mock());
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(api.handler_count(), 1);
        assert_eq!(api.live_handles(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_noop() {
        let (manager, _api, _distributor) = harness(mock());
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything() {
        let (manager, api, _distributor) = harness(mock());
        let mut connectivity = manager.subscribe_connectivity();
        manager.connect().await.unwrap();
        assert!(connectivity.recv().await.unwrap());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(api.live_handles(), 0);
        assert_eq!(api.handler_count(), 0);
        assert!(!api.is_online());
        assert!(!connectivity.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_happens_before_release() {
        let (manager, api, _distributor) = harness(mock());
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();

        let log = api.call_log();
        let unsubscribe = log
            .iter()
            .position(|c| c == "remove_scan_handler")
            .expect("handler removed");
        let release = log
            .iter()
            .position(|c| c == "release_instrument")
            .expect("instrument released");
        assert!(unsubscribe < release);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_no_resources() {
        for point in [
            FailPoint::OnlineAccess,
            FailPoint::Instrument,
            FailPoint::ScanContainer,
            FailPoint::Subscribe,
        ] {
            let (manager, api, _distributor) = harness(mock());
            api.inject_failure(point);

            let err = manager.connect().await.unwrap_err();
            assert!(
                matches!(err, BridgeError::ConnectionFailed(_)),
                "{point:?}: {err}"
            );
            assert_eq!(manager.state(), ConnectionState::Disconnected, "{point:?}");
            assert_eq!(api.live_handles(), 0, "{point:?}");
            assert_eq!(api.handler_count(), 0, "{point:?}");
            assert!(!manager.status().online_access, "{point:?}");

            // The machine is usable again after the failure.
            manager.connect().await.unwrap();
            assert_eq!(manager.state(), ConnectionState::Connected, "{point:?}");
        }
    }

    #[tokio::test]
    async fn test_connect_failure_emits_disconnected_event() {
        let (manager, api, _distributor) = harness(mock());
        let mut connectivity = manager.subscribe_connectivity();
        api.inject_failure(FailPoint::ScanContainer);

        assert!(manager.connect().await.is_err());
        assert!(!connectivity.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_driver_not_found_surfaces_from_connect() {
        let factory: DriverFactory =
            Arc::new(|| Err(BridgeError::DriverNotFound("exploris".to_string())));
        let distributor = ScanDistributor::new(&TelemetryConfig {
            throttle_interval: Duration::from_millis(10),
            client_buffer: 8,
        });
        let manager = ConnectionManager::new(factory, 0, distributor);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::DriverNotFound(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_is_rejected() {
        let (manager, _api, _distributor) =
            harness(MockInstrumentApi::new(Duration::from_millis(5), 10).with_latency(
                Duration::from_millis(50),
            ));

        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        // Let the connect task reach its first driver call.
        while manager.state() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }

        let err = manager.disconnect().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidStateTransition {
                operation: "disconnect",
                ..
            }
        ));

        // The rejected call did not alter the in-flight transition.
        connecting.await.unwrap().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_failure_still_settles() {
        let (manager, api, _distributor) = harness(mock());
        manager.connect().await.unwrap();

        api.inject_failure(FailPoint::Release);
        let err = manager.disconnect().await.unwrap_err();
        assert!(matches!(err, BridgeError::DisconnectFailed(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.status().online_access);
    }

    #[tokio::test]
    async fn test_scans_flow_to_distributor_while_connected() {
        let (manager, api, distributor) = harness(mock());
        let mut subscription = distributor.add_subscriber(Some(Duration::from_millis(1)));
        manager.connect().await.unwrap();

        api.emit_scan(RawScan {
            masses: vec![100.0, 200.0],
            intensities: vec![5.0, 9.0],
        });
        let summary = subscription.recv().await.expect("summary delivered");
        assert_eq!(summary.scan_number, 1);
        assert_eq!(summary.centroid_count, 2);

        // Scan numbers keep increasing across events.
        tokio::time::sleep(Duration::from_millis(5)).await;
        api.emit_scan(RawScan {
            masses: vec![100.0],
            intensities: vec![1.0],
        });
        let next = subscription.recv().await.expect("second summary");
        assert_eq!(next.scan_number, 2);
    }

    #[tokio::test]
    async fn test_no_scans_after_disconnect() {
        let (manager, api, distributor) = harness(mock());
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();

        let mut subscription = distributor.add_subscriber(Some(Duration::from_millis(1)));
        api.emit_scan(RawScan {
            masses: vec![100.0],
            intensities: vec![1.0],
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(50), subscription.recv())
            .await
            .is_err();
        assert!(timed_out, "detached handler must not forward scans");
    }

    #[tokio::test]
    async fn test_acquisition_requires_connection() {
        let (manager, _api, _distributor) = harness(mock());
        assert!(matches!(
            manager.start_acquisition().await.unwrap_err(),
            BridgeError::NotConnected
        ));
        assert!(matches!(
            manager.stop_acquisition().await.unwrap_err(),
            BridgeError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_acquisition_toggles_status_flag() {
        let (manager, api, _distributor) = harness(mock());
        manager.connect().await.unwrap();

        manager.start_acquisition().await.unwrap();
        assert!(manager.status().acquisition_active);
        assert!(api.is_acquiring());

        manager.stop_acquisition().await.unwrap();
        assert!(!manager.status().acquisition_active);
        assert!(!api.is_acquiring());
    }

    #[tokio::test]
    async fn test_connectivity_events_in_transition_order() {
        let (manager, _api, _distributor) = harness(mock());
        let mut connectivity = manager.subscribe_connectivity();

        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();

        assert!(connectivity.recv().await.unwrap());
        assert!(!connectivity.recv().await.unwrap());
        assert!(connectivity.recv().await.unwrap());
    }
}
