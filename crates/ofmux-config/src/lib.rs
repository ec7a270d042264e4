//! Configuration types shared by `ofmux` controllers and their embedders.
//!
//! The controller is a library: the embedding application constructs a
//! [`Config`], hands it to the runtime, and the runtime treats it as
//! immutable from then on. This crate holds the configuration surface plus
//! the telemetry types both sides need to agree on — log format, default
//! filter, and the debug environment toggle.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod defaults;
mod endpoint;
mod framing;
mod logging;
mod signal;
pub mod telemetry;
mod tls;

pub use endpoint::{EndpointParseError, ListenEndpoint};
pub use framing::Framing;
pub use logging::{debug_enabled, LogFormat};
pub use signal::ExitSignal;
pub use telemetry::{TelemetryError, TelemetryOptions};
pub use tls::TlsIdentity;

/// Controller configuration.
///
/// All fields have serviceable defaults; a controller constructed from
/// `Config::default()` spawns the `oftr` helper but listens on nothing.
///
/// # Example
///
/// ```
/// use ofmux_config::{Config, ListenEndpoint};
///
/// let mut config = Config::default();
/// config.listen_endpoints = vec![":6653".parse().expect("endpoint")];
/// config.validate().expect("valid configuration");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Endpoints to accept OpenFlow connections on; empty disables listening.
    pub listen_endpoints: Vec<ListenEndpoint>,
    /// OpenFlow protocol versions offered to connecting switches.
    pub listen_versions: BTreeSet<u8>,
    /// OS signals that request a graceful shutdown.
    pub exit_signals: Vec<ExitSignal>,
    /// TLS identity for listener endpoints; absent disables TLS.
    pub tls: Option<TlsIdentity>,
    /// Path to the `oftr` helper binary.
    pub oftr_path: PathBuf,
    /// Extra arguments passed through to the helper verbatim.
    pub oftr_args: Vec<String>,
    /// Framing used on the helper channel.
    pub framing: Framing,
    /// Deadline applied to each RPC request.
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
    /// Window allowed for handler tasks to wind down during shutdown.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_endpoints: Vec::new(),
            listen_versions: defaults::listen_versions(),
            exit_signals: defaults::exit_signals(),
            tls: None,
            oftr_path: defaults::oftr_path(),
            oftr_args: Vec::new(),
            framing: Framing::default(),
            rpc_timeout: defaults::rpc_timeout(),
            shutdown_grace: defaults::shutdown_grace(),
        }
    }
}

impl Config {
    /// Checks the configuration for values the runtime cannot honour.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when an OpenFlow version is out of range or
    /// a configured TLS file does not exist.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for version in &self.listen_versions {
            if !(1..=6).contains(version) {
                return Err(ConfigError::VersionOutOfRange { version: *version });
            }
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// Errors raised while validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An OpenFlow version outside the defined 1–6 range was requested.
    #[error("OpenFlow version {version} is out of range (expected 1-6)")]
    VersionOutOfRange {
        /// The rejected version number.
        version: u8,
    },

    /// A TLS identity referenced a file that is missing.
    #[error("TLS {role} file '{path}' does not exist")]
    TlsFileMissing {
        /// Which part of the identity was missing (certificate, key, CA).
        role: &'static str,
        /// The path that was checked.
        path: PathBuf,
    },
}

/// Serialises [`Duration`] fields as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}
