//! Helper channel framing selection.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How JSON objects are delimited on the helper's stdio channel.
///
/// The codec itself lives with the driver; this type only records which
/// strategy a configuration selects.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Framing {
    /// One JSON object per newline-terminated line.
    #[default]
    LineDelimited,
    /// Each JSON object preceded by a big-endian `u32` byte length.
    LengthPrefixed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        let framing: Framing = "LENGTH_PREFIXED".parse().expect("framing should parse");
        assert_eq!(framing, Framing::LengthPrefixed);
        assert_eq!(Framing::LineDelimited.to_string(), "line_delimited");
    }
}
