//! Listener endpoint parsing.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A `host:port` pair to accept OpenFlow connections on.
///
/// The host part may be empty to listen on every interface, and IPv6
/// addresses are written in brackets:
///
/// ```
/// use ofmux_config::ListenEndpoint;
///
/// let all: ListenEndpoint = ":6653".parse().expect("endpoint");
/// assert!(all.host().is_none());
///
/// let v6: ListenEndpoint = "[::1]:6653".parse().expect("endpoint");
/// assert_eq!(v6.host(), Some("::1"));
/// assert_eq!(v6.to_string(), "[::1]:6653");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenEndpoint {
    host: Option<String>,
    port: u16,
}

impl ListenEndpoint {
    /// Builds an endpoint bound to a specific host.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
        }
    }

    /// Builds an endpoint listening on every interface.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self { host: None, port }
    }

    /// Returns the host part, if one was given.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.as_deref() {
            Some(host) if host.contains(':') => write!(formatter, "[{host}]:{}", self.port),
            Some(host) => write!(formatter, "{host}:{}", self.port),
            None => write!(formatter, ":{}", self.port),
        }
    }
}

impl FromStr for ListenEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_endpoint(input)?;
        let port: u16 = port
            .parse()
            .map_err(|_| EndpointParseError::InvalidPort(input.to_string()))?;
        if port == 0 {
            return Err(EndpointParseError::InvalidPort(input.to_string()));
        }
        Ok(Self { host, port })
    }
}

/// Splits an endpoint string into host and port parts.
fn split_endpoint(input: &str) -> Result<(Option<String>, &str), EndpointParseError> {
    if let Some(rest) = input.strip_prefix('[') {
        // Bracketed IPv6 form: [host]:port
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| EndpointParseError::UnbalancedBrackets(input.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| EndpointParseError::MissingPort(input.to_string()))?;
        if host.is_empty() {
            return Err(EndpointParseError::MissingHost(input.to_string()));
        }
        return Ok((Some(host.to_string()), port));
    }

    match input.rsplit_once(':') {
        // Bare IPv6 without brackets is ambiguous; require brackets.
        Some((host, _)) if host.contains(':') => {
            Err(EndpointParseError::UnbalancedBrackets(input.to_string()))
        }
        Some(("", port)) => Ok((None, port)),
        Some((host, port)) => Ok((Some(host.to_string()), port)),
        // A bare number is accepted as a port on every interface.
        None => Ok((None, input)),
    }
}

impl Serialize for ListenEndpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ListenEndpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Errors encountered while parsing a [`ListenEndpoint`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    /// The port part was absent or empty.
    #[error("missing port in endpoint '{0}'")]
    MissingPort(String),
    /// A bracketed host was empty.
    #[error("missing host in endpoint '{0}'")]
    MissingHost(String),
    /// The port was not a number in 1-65535.
    #[error("invalid port in endpoint '{0}'")]
    InvalidPort(String),
    /// IPv6 hosts must be bracketed.
    #[error("unbalanced brackets in endpoint '{0}'")]
    UnbalancedBrackets(String),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::any_interface(":6653", None, 6653)]
    #[case::bare_port("6653", None, 6653)]
    #[case::hostname("controller.local:6653", Some("controller.local"), 6653)]
    #[case::ipv4("10.0.0.1:6633", Some("10.0.0.1"), 6633)]
    #[case::ipv6("[fe80::1]:6653", Some("fe80::1"), 6653)]
    fn parses_endpoint(#[case] input: &str, #[case] host: Option<&str>, #[case] port: u16) {
        let endpoint: ListenEndpoint = input.parse().expect("endpoint should parse");
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
    }

    #[rstest]
    #[case::empty("", EndpointParseError::InvalidPort(String::new()))]
    #[case::port_zero("host:0", EndpointParseError::InvalidPort("host:0".into()))]
    #[case::bare_ipv6("fe80::1:6653", EndpointParseError::UnbalancedBrackets("fe80::1:6653".into()))]
    #[case::empty_bracket("[]:6653", EndpointParseError::MissingHost("[]:6653".into()))]
    fn rejects_endpoint(#[case] input: &str, #[case] expected: EndpointParseError) {
        let error = input
            .parse::<ListenEndpoint>()
            .expect_err("endpoint should be rejected");
        assert_eq!(error, expected);
    }

    #[test]
    fn display_round_trips() {
        for text in [":6653", "switch:6633", "[::1]:6653"] {
            let endpoint: ListenEndpoint = text.parse().expect("endpoint");
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let endpoint = ListenEndpoint::new("::1", 6653);
        let json = serde_json::to_string(&endpoint).expect("serialise");
        assert_eq!(json, "\"[::1]:6653\"");
        let parsed: ListenEndpoint = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(parsed, endpoint);
    }
}
