//! Core library for the scanbridge application.
//!
//! scanbridge bridges a mass spectrometer's live scan stream to remote
//! visualization clients. The library contains the vendor driver seam, the
//! connection lifecycle manager, the throttled telemetry distributor, the
//! scan summarizer, and the HTTP/SSE/websocket surface used by the server
//! binary.

pub mod config;
pub mod connection;
pub mod core;
pub mod distributor;
pub mod driver;
pub mod error;
pub mod server;
pub mod summary;
