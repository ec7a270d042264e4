//! Default values shared by the configuration surface.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::signal::ExitSignal;

/// Default OpenFlow version offered to switches (1.3).
pub const DEFAULT_LISTEN_VERSION: u8 = 4;

/// Default helper binary name, resolved through `PATH`.
pub const DEFAULT_OFTR_PATH: &str = "oftr";

/// Default per-request deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Default shutdown grace window for handler tasks.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Default log filter expression when `ZOFDEBUG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// OpenFlow versions offered by default.
#[must_use]
pub fn listen_versions() -> BTreeSet<u8> {
    BTreeSet::from([DEFAULT_LISTEN_VERSION])
}

/// Signals that request shutdown by default.
#[must_use]
pub fn exit_signals() -> Vec<ExitSignal> {
    vec![ExitSignal::Interrupt, ExitSignal::Terminate]
}

/// Default helper binary path.
#[must_use]
pub fn oftr_path() -> PathBuf {
    PathBuf::from(DEFAULT_OFTR_PATH)
}

/// Default per-request deadline.
#[must_use]
pub fn rpc_timeout() -> Duration {
    DEFAULT_RPC_TIMEOUT
}

/// Default shutdown grace window.
#[must_use]
pub fn shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}
