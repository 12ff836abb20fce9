//! Custom error types for the application.
//!
//! This module defines the primary error type, `BridgeError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that occur
//! between the vendor driver boundary and the HTTP surface.
//!
//! ## Error Hierarchy
//!
//! `BridgeError` consolidates the failure modes of the bridge:
//!
//! - **`Config`** / **`Configuration`**: file/env parsing failures and
//!   semantic validation failures of the loaded settings.
//! - **`DriverNotFound`**: the vendor driver capability could not be
//!   discovered at all (missing SDK installation, unknown driver name).
//! - **`ConnectionFailed`**: any step of the connect acquisition sequence
//!   failed; wraps the underlying driver error. The connection manager
//!   guarantees state has settled back to `Disconnected` when this is
//!   returned.
//! - **`DisconnectFailed`**: a teardown step failed. Non-fatal; the state
//!   machine still settles to `Disconnected`.
//! - **`InvalidStateTransition`**: a connect/disconnect call arrived while
//!   another transition was in flight. The call is rejected, never queued.
//! - **`MalformedScan`**: a scan payload violated the paired-array
//!   invariant. Surfaced per event; never tears down the connection.
//! - **`NotConnected`**: an acquisition-control operation was attempted
//!   without a live connection.
//! - **`Instrument`**: a driver call failed on an established connection
//!   (e.g. acquisition control was refused).
//!
//! By using `#[from]`, `BridgeError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the
//! application with the `?` operator.

use crate::core::ConnectionState;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument driver not found: {0}")]
    DriverNotFound(String),

    #[error("Failed to connect to instrument: {0:#}")]
    ConnectionFailed(anyhow::Error),

    #[error("Failed to disconnect from instrument: {0:#}")]
    DisconnectFailed(anyhow::Error),

    #[error("Operation '{operation}' is invalid while connection is {state}")]
    InvalidStateTransition {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Malformed scan: {masses} masses but {intensities} intensities")]
    MalformedScan { masses: usize, intensities: usize },

    #[error("Instrument is not connected")]
    NotConnected,

    #[error("Instrument error: {0:#}")]
    Instrument(anyhow::Error),
}
