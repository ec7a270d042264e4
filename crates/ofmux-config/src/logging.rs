//! Logging configuration types.
//!
//! Defines the [`LogFormat`] enumeration along with the `ZOFDEBUG`
//! environment toggle that elevates the default log level and switches the
//! helper into RPC tracing.

use std::env;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Environment variable that enables debug diagnostics end to end.
pub const DEBUG_ENV_VAR: &str = "ZOFDEBUG";

/// Supported logging output formats.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// Human-readable single line output.
    #[default]
    Compact,
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
}

/// Whether `ZOFDEBUG` requests debug diagnostics.
///
/// Any non-empty value other than `0` enables the flag.
#[must_use]
pub fn debug_enabled() -> bool {
    match env::var(DEBUG_ENV_VAR) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}
