//! Domain errors raised by the controller runtime.
//!
//! All errors use `thiserror`-derived types with structured context so
//! callers can inspect failures programmatically. The taxonomy follows the
//! boundaries of the runtime: startup, the helper channel, individual
//! requests, and user handlers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Boxed error type carried out of user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while bringing the controller up.
///
/// Startup errors abort `run()` and map to process exit code 1.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The helper binary could not be launched.
    #[error("failed to launch helper '{path}': {source}")]
    Spawn {
        /// Path the runtime tried to execute.
        path: PathBuf,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The startup handshake with the helper failed.
    #[error("helper handshake failed: {source}")]
    Handshake {
        /// The failed `OFP.DESCRIPTION` request.
        #[source]
        source: RequestError,
    },

    /// The helper speaks an incompatible RPC API version.
    #[error("helper reports unsupported API version '{reported}' (expected {expected})")]
    ApiVersion {
        /// Version string the helper reported.
        reported: String,
        /// Version this runtime understands.
        expected: &'static str,
    },

    /// A configured OpenFlow version is not supported by the helper.
    #[error("OpenFlow versions {versions:?} are not supported by the helper")]
    UnsupportedVersions {
        /// The rejected versions.
        versions: Vec<u8>,
    },

    /// The TLS identity could not be registered with the helper.
    #[error("failed to configure TLS identity: {source}")]
    Tls {
        /// The failed `OFP.ADD_IDENTITY` request.
        #[source]
        source: RequestError,
    },

    /// A listen endpoint could not be opened.
    #[error("failed to listen on '{endpoint}': {source}")]
    Listen {
        /// The endpoint that failed.
        endpoint: String,
        /// The failed `OFP.LISTEN` request.
        #[source]
        source: RequestError,
    },

    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ofmux_config::ConfigError),
}

/// Fatal framing or encoding faults on the helper channel.
///
/// A protocol error terminates the run; there is no way to resynchronise a
/// corrupted frame stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame did not contain valid JSON.
    #[error("helper emitted invalid JSON: {detail}")]
    InvalidJson {
        /// Parser diagnostic.
        detail: String,
    },

    /// A frame exceeded the maximum permitted length.
    #[error("helper emitted an oversized frame ({length} bytes)")]
    OversizedFrame {
        /// Claimed or observed frame length.
        length: usize,
    },
}

/// Errors surfaced by the helper channel itself.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The channel closed: EOF was observed and the child reaped.
    ///
    /// This is the terminal sentinel; every receive after it reports the
    /// same value.
    #[error("helper channel closed")]
    Closed,

    /// The helper emitted a malformed frame.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure of a single request submitted through the RPC transport.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The channel (or the datapath the request targeted) closed while the
    /// request was outstanding.
    #[error("channel closed while the request was pending")]
    Closed,

    /// No reply arrived within the per-request deadline.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// The deadline that expired.
        after: Duration,
    },

    /// The helper reported a structured RPC error.
    #[error("helper error {code}: {message}")]
    Rpc {
        /// Error code from the helper.
        code: i64,
        /// Human-readable message from the helper.
        message: String,
    },

    /// The switch answered the request with an OpenFlow ERROR message.
    #[error("request failed with an ERROR reply")]
    ErrorReply {
        /// Full body of the ERROR message.
        body: serde_json::Value,
    },

    /// The helper could not deliver the request to the switch.
    #[error("request could not be delivered: {alert}")]
    Delivery {
        /// Alert text reported by the helper.
        alert: String,
    },
}

/// A failure escaping a user handler, tagged with its origin.
#[derive(Debug)]
pub struct HandlerError {
    event: String,
    conn_id: Option<u64>,
    source: BoxError,
}

impl HandlerError {
    pub(crate) fn new(event: impl Into<String>, conn_id: Option<u64>, source: BoxError) -> Self {
        Self {
            event: event.into(),
            conn_id,
            source,
        }
    }

    /// Name of the event whose handler failed (e.g. `PACKET_IN`).
    #[must_use]
    pub fn event(&self) -> &str {
        self.event.as_str()
    }

    /// Connection the event belonged to, when it was datapath-scoped.
    #[must_use]
    pub const fn conn_id(&self) -> Option<u64> {
        self.conn_id
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conn_id {
            Some(conn_id) => write!(
                formatter,
                "handler for '{}' on connection {conn_id} failed: {}",
                self.event, self.source
            ),
            None => write!(
                formatter,
                "handler for '{}' failed: {}",
                self.event, self.source
            ),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Terminal failures reported by [`Controller::run`](crate::Controller::run).
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The controller could not start.
    #[error(transparent)]
    Startup(#[from] StartupError),

    /// The helper violated the channel framing; the run was aborted.
    #[error("helper protocol fault: {0}")]
    Protocol(#[from] ProtocolError),

    /// The helper exited while the controller was running.
    #[error("helper process exited unexpectedly (status {status:?})")]
    HelperCrashed {
        /// Exit status of the helper, when one could be collected.
        status: Option<i32>,
    },
}

impl ControllerError {
    /// Process exit code for this failure: 1 for startup faults, 2 when the
    /// helper crashed or corrupted the channel.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Startup(_) => 1,
            Self::Protocol(_) | Self::HelperCrashed { .. } => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_display_includes_connection() {
        let error = HandlerError::new("PACKET_IN", Some(7), "boom".into());
        assert_eq!(
            error.to_string(),
            "handler for 'PACKET_IN' on connection 7 failed: boom"
        );
    }

    #[test]
    fn handler_error_display_without_connection() {
        let error = HandlerError::new("SIGNAL", None, "boom".into());
        assert_eq!(error.to_string(), "handler for 'SIGNAL' failed: boom");
    }

    #[test]
    fn exit_codes_follow_failure_class() {
        let startup = ControllerError::Startup(StartupError::ApiVersion {
            reported: "0.1".into(),
            expected: "0.9",
        });
        assert_eq!(startup.exit_code(), 1);
        let crashed = ControllerError::HelperCrashed { status: Some(9) };
        assert_eq!(crashed.exit_code(), 2);
    }
}
