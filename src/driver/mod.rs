//! Vendor instrument driver seam.
//!
//! The vendor SDK is a black box behind three capability traits that mirror
//! its surface: a driver container granting online access, an instrument
//! handle, and the instrument's scan container with native scan-arrived
//! notifications. The connection manager consumes these traits only; the
//! concrete driver is chosen at startup by [`factory_for`].
//!
//! Real hardware drivers plug in behind the same traits. The built-in
//! [`mock::MockInstrumentApi`] stands in for the SDK in tests and when no
//! instrument is attached.

pub mod mock;

use crate::config::InstrumentConfig;
use crate::error::{AppResult, BridgeError};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use mock::{FailPoint, MockInstrumentApi};

/// Native scan payload as delivered by the driver, before the subscriber
/// stamps it with a scan number and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct RawScan {
    /// Centroid m/z values.
    pub masses: Vec<f64>,
    /// Centroid intensities.
    pub intensities: Vec<f64>,
}

/// Callback invoked on the driver's own thread for each arriving scan.
///
/// Must be non-blocking: it runs on the driver's notification context and
/// may only hand the payload off.
pub type ScanHandler = Arc<dyn Fn(RawScan) + Send + Sync>;

/// Opaque identifier for an installed scan handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Entry capability of the vendor driver container.
#[async_trait]
pub trait InstrumentApi: Send + Sync {
    /// Start driver-level online access (live control/data streaming mode).
    async fn start_online_access(&self) -> Result<()>;

    /// Stop online access, ending the live session. Idempotent.
    async fn stop_online_access(&self) -> Result<()>;

    /// Acquire the instrument at `index`.
    async fn instrument(&self, index: u32) -> Result<Arc<dyn InstrumentHandle>>;
}

/// An open connection to one instrument.
#[async_trait]
pub trait InstrumentHandle: Send + Sync {
    /// Acquire the scan container at `index`.
    async fn scan_container(&self, index: u32) -> Result<Arc<dyn ScanContainerHandle>>;

    /// Begin an acquisition run.
    async fn start_acquisition(&self) -> Result<()>;

    /// Cancel the current acquisition run.
    async fn stop_acquisition(&self) -> Result<()>;

    /// Release the instrument handle. Idempotent.
    async fn release(&self) -> Result<()>;
}

/// The instrument's native scan event source.
#[async_trait]
pub trait ScanContainerHandle: Send + Sync {
    /// Install a scan-arrived handler.
    async fn add_scan_handler(&self, handler: ScanHandler) -> Result<HandlerId>;

    /// Remove an installed handler. Removing an unknown or already-removed
    /// handler is a no-op.
    async fn remove_scan_handler(&self, id: HandlerId) -> Result<()>;

    /// Release the container handle. Idempotent.
    async fn release(&self) -> Result<()>;
}

/// Factory producing a ready driver container, called at connect time.
///
/// Discovery failures surface as [`BridgeError::DriverNotFound`].
pub type DriverFactory = Arc<dyn Fn() -> AppResult<Arc<dyn InstrumentApi>> + Send + Sync>;

/// Resolve the configured driver name to a factory.
///
/// The lookup itself is deferred to connect time, matching the vendor
/// pattern of locating the SDK when the connection is opened. Unknown names
/// fail there with `DriverNotFound`.
pub fn factory_for(config: &InstrumentConfig) -> DriverFactory {
    match config.driver.as_str() {
        "mock" => {
            let api = Arc::new(MockInstrumentApi::new(
                config.mock_scan_interval,
                config.mock_centroids,
            ));
            Arc::new(move || Ok(api.clone() as Arc<dyn InstrumentApi>))
        }
        other => {
            let name = other.to_string();
            Arc::new(move || Err(BridgeError::DriverNotFound(name.clone())))
        }
    }
}
