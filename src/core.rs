//! Core data types for the telemetry bridge.
//!
//! This module defines the value types that flow between the driver seam,
//! the connection manager, the distributor, and the HTTP surface.
//!
//! # Data Flow
//!
//! ```text
//! driver callback --[ScanEvent]--> distributor slot ---> per-subscriber
//!                                                        [ScanSummary]
//! ```
//!
//! # Thread Safety
//!
//! All types are plain owned data (`Send + Sync` by construction). Scans are
//! wrapped in `Arc` once inside the distributor so fan-out never copies the
//! mass/intensity arrays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the managed instrument connection.
///
/// Exactly one instance exists per managed instrument. It is mutated only by
/// the connection manager and observed through a `watch` channel, so reads
/// never block on an in-flight transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No driver resources are held.
    Disconnected,
    /// The acquisition sequence is in flight.
    Connecting,
    /// A device handle is held and scan events are subscribed.
    Connected,
    /// Teardown is in flight.
    Disconnecting,
}

impl ConnectionState {
    /// True only in the fully-established state.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

/// One instrument measurement cycle: paired mass/intensity arrays.
///
/// Produced by the scan subscriber from the driver's native notification and
/// consumed by the distributor. Not retained after distribution; the
/// distributor holds at most the latest one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanEvent {
    /// Monotonically increasing scan counter assigned by the producer.
    pub scan_number: u64,
    /// UTC timestamp when the scan notification arrived.
    pub timestamp: DateTime<Utc>,
    /// Centroid m/z values, same length as `intensities`.
    pub masses: Vec<f64>,
    /// Centroid intensities, same length as `masses`.
    pub intensities: Vec<f64>,
}

impl ScanEvent {
    /// Number of centroids in this scan.
    pub fn centroid_count(&self) -> usize {
        self.masses.len()
    }
}

/// A single (mass, intensity) centroid within a scan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// m/z value of the centroid.
    pub mass: f64,
    /// Intensity of the centroid.
    pub intensity: f64,
}

/// Renderer-ready projection of one scan.
///
/// Computed fresh per delivery by [`crate::summary::summarize`]; never cached
/// across subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Scan counter carried over from the source event.
    pub scan_number: u64,
    /// UTC timestamp carried over from the source event.
    pub timestamp: DateTime<Utc>,
    /// Centroid m/z values.
    pub masses: Vec<f64>,
    /// Centroid intensities.
    pub intensities: Vec<f64>,
    /// Number of centroids.
    pub centroid_count: usize,
    /// Total ion current (sum of intensities).
    pub tic: f64,
    /// Most intense centroid, if the scan is non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_peak: Option<Peak>,
    /// Up to five most intense centroids, intensity-descending.
    pub top_peaks: Vec<Peak>,
}

/// Snapshot returned by the status endpoint.
///
/// A pure projection of connection manager state; `instrument_connected` is
/// true exactly when the state machine is `Connected`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// True when the connection state machine is `Connected`.
    pub instrument_connected: bool,
    /// True while driver online access is established.
    pub online_access: bool,
    /// True between successful start/stop acquisition calls.
    pub acquisition_active: bool,
    /// Raw state, including transitional states.
    pub connection_state: ConnectionState,
}
