//! Exit signal selection.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// OS signals a controller treats as shutdown requests.
///
/// The runtime translates each configured signal into an in-band event so
/// that handlers observe it in dispatch order and may veto the default exit.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExitSignal {
    /// `SIGINT`, typically from the terminal.
    Interrupt,
    /// `SIGTERM`, typically from a supervisor.
    Terminate,
    /// `SIGHUP`.
    Hangup,
    /// `SIGUSR1`.
    User1,
    /// `SIGUSR2`.
    User2,
}
