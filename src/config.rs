//! Configuration loading for the bridge using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `SCANBRIDGE_`
//! 2. TOML configuration file (default: `config/scanbridge.toml`)
//!
//! # Example
//!
//! ```no_run
//! use scanbridge::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load()?;
//!     println!("bind: {}", settings.server.bind);
//!     println!("throttle: {:?}", settings.telemetry.throttle_interval);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Any configuration value can be overridden via environment variables with
//! the `SCANBRIDGE_` prefix and key path separated by underscores:
//!
//! ```text
//! SCANBRIDGE_SERVER_BIND="0.0.0.0:8080"
//! SCANBRIDGE_TELEMETRY_THROTTLE_INTERVAL="250ms"
//! SCANBRIDGE_INSTRUMENT_DRIVER=mock
//! ```

use crate::error::{AppResult, BridgeError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Instrument driver settings.
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Telemetry distribution settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. "0.0.0.0:5001".
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Instrument driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Driver selection ("mock" is the only built-in).
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Instrument index passed to the driver container.
    #[serde(default)]
    pub instrument_index: u32,
    /// Interval between synthetic scans produced by the mock driver.
    #[serde(with = "humantime_serde", default = "default_scan_interval")]
    pub mock_scan_interval: Duration,
    /// Centroids per synthetic scan produced by the mock driver.
    #[serde(default = "default_mock_centroids")]
    pub mock_centroids: usize,
}

/// Telemetry distribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Minimum spacing between deliveries to one subscriber.
    #[serde(with = "humantime_serde", default = "default_throttle_interval")]
    pub throttle_interval: Duration,
    /// Bounded per-client delivery channel capacity.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

fn default_bind() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_driver() -> String {
    "mock".to_string()
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_mock_centroids() -> usize {
    100
}

fn default_throttle_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_client_buffer() -> usize {
    8
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            instrument_index: 0,
            mock_scan_interval: default_scan_interval(),
            mock_centroids: default_mock_centroids(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            throttle_interval: default_throttle_interval(),
            client_buffer: default_client_buffer(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            instrument: InstrumentConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from the default location and environment.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Config` if extraction fails or
    /// `BridgeError::Configuration` if validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/scanbridge.toml")
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: defaults plus environment overrides
    /// apply, which keeps the binary usable with zero on-disk config.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCANBRIDGE_").split("_"))
            .extract()
            .map_err(BridgeError::Config)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is one of trace, debug, info, warn, error
    /// - Bind address parses as a socket address
    /// - Throttle interval and client buffer are non-zero
    pub fn validate(&self) -> AppResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.server.log_level.as_str()) {
            return Err(BridgeError::Configuration(format!(
                "invalid log level '{}', expected one of {:?}",
                self.server.log_level, LEVELS
            )));
        }

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(BridgeError::Configuration(format!(
                "invalid bind address '{}'",
                self.server.bind
            )));
        }

        if self.telemetry.throttle_interval.is_zero() {
            return Err(BridgeError::Configuration(
                "throttle_interval must be non-zero".to_string(),
            ));
        }

        if self.telemetry.client_buffer == 0 {
            return Err(BridgeError::Configuration(
                "client_buffer must be non-zero".to_string(),
            ));
        }

        if self.instrument.mock_scan_interval.is_zero() {
            return Err(BridgeError::Configuration(
                "mock_scan_interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
