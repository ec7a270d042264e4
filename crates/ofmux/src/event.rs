//! The event model shared by the transport, dispatcher, and handlers.
//!
//! Events are forwarded from the helper as parsed JSON. The runtime lifts
//! out the attributes it needs for routing (type, connection, transaction
//! id) and leaves the body opaque; handlers pick apart whatever message
//! fields they care about.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Tracing target for event decoding.
const EVENT_TARGET: &str = "ofmux::event";

/// A 64-bit OpenFlow datapath identifier.
///
/// The canonical text form is eight colon-separated hex octets:
///
/// ```
/// use ofmux::DatapathId;
///
/// let dpid: DatapathId = "00:00:00:00:00:00:00:01".parse().expect("dpid");
/// assert_eq!(u64::from(dpid), 1);
/// assert_eq!(dpid.to_string(), "00:00:00:00:00:00:00:01");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(u64);

impl DatapathId {
    /// Builds an identifier from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl From<u64> for DatapathId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<DatapathId> for u64 {
    fn from(dpid: DatapathId) -> Self {
        dpid.0
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octets = self.0.to_be_bytes();
        write!(
            formatter,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            octets[0], octets[1], octets[2], octets[3], octets[4], octets[5], octets[6], octets[7]
        )
    }
}

impl FromStr for DatapathId {
    type Err = DatapathIdParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let reject = || DatapathIdParseError {
            input: input.to_string(),
        };

        if input.contains(':') {
            let mut octets = [0u8; 8];
            let mut parts = input.split(':');
            for octet in &mut octets {
                let part = parts.next().ok_or_else(reject)?;
                if part.len() != 2 {
                    return Err(reject());
                }
                *octet = u8::from_str_radix(part, 16).map_err(|_| reject())?;
            }
            if parts.next().is_some() {
                return Err(reject());
            }
            return Ok(Self(u64::from_be_bytes(octets)));
        }

        // Bare hex form, with or without a 0x prefix.
        let digits = input.strip_prefix("0x").unwrap_or(input);
        if digits.is_empty() || digits.len() > 16 {
            return Err(reject());
        }
        u64::from_str_radix(digits, 16).map(Self).map_err(|_| reject())
    }
}

impl Serialize for DatapathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatapathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Errors from parsing a [`DatapathId`] from text.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid datapath id '{input}'")]
pub struct DatapathIdParseError {
    /// The rejected input.
    input: String,
}

/// Classification of an incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A datapath completed negotiation and is ready.
    ChannelUp,
    /// A datapath connection terminated.
    ChannelDown,
    /// The helper reported a connection anomaly.
    ChannelAlert,
    /// Any other forwarded message, named by its OpenFlow type.
    Message(String),
}

impl EventKind {
    /// Classifies an event by its wire type name.
    #[must_use]
    pub fn from_type(name: &str) -> Self {
        match name {
            "CHANNEL_UP" => Self::ChannelUp,
            "CHANNEL_DOWN" => Self::ChannelDown,
            "CHANNEL_ALERT" => Self::ChannelAlert,
            other => Self::Message(other.to_string()),
        }
    }

    /// The wire type name for this kind.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ChannelUp => "CHANNEL_UP",
            Self::ChannelDown => "CHANNEL_DOWN",
            Self::ChannelAlert => "CHANNEL_ALERT",
            Self::Message(name) => name.as_str(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// A decoded event, immutable once dispatched.
///
/// The routing attributes are lifted out of the body during decoding; the
/// body itself is the full parameter object the helper sent (or, for the
/// synthesised CHANNEL_UP, the merged negotiation result).
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    conn_id: Option<u64>,
    datapath_id: Option<DatapathId>,
    xid: Option<u32>,
    body: Value,
}

impl Event {
    /// Decodes an `OFP.MESSAGE` parameter object into an event.
    ///
    /// Returns `None` (and logs) when the object carries no `type` field.
    #[must_use]
    pub(crate) fn from_params(params: Value) -> Option<Self> {
        let Some(name) = params.get("type").and_then(Value::as_str) else {
            tracing::warn!(target: EVENT_TARGET, "discarding event without a type field");
            return None;
        };
        let kind = EventKind::from_type(name);
        let conn_id = params.get("conn_id").and_then(Value::as_u64);
        let xid = params
            .get("xid")
            .and_then(Value::as_u64)
            .and_then(|xid| u32::try_from(xid).ok());
        let datapath_id = params
            .get("datapath_id")
            .and_then(Value::as_str)
            .and_then(|text| text.parse().ok());
        Some(Self {
            kind,
            conn_id,
            datapath_id,
            xid,
            body: params,
        })
    }

    /// Builds the synthesised CHANNEL_UP event from a merged negotiation
    /// result.
    pub(crate) fn channel_up(conn_id: u64, datapath_id: DatapathId, body: Value) -> Self {
        Self {
            kind: EventKind::ChannelUp,
            conn_id: Some(conn_id),
            datapath_id: Some(datapath_id),
            xid: None,
            body,
        }
    }

    /// Builds a CHANNEL_DOWN event for a connection being torn down.
    pub(crate) fn channel_down(conn_id: u64, datapath_id: Option<DatapathId>) -> Self {
        let mut body = serde_json::json!({
            "type": "CHANNEL_DOWN",
            "conn_id": conn_id,
        });
        if let Some(dpid) = datapath_id {
            body["datapath_id"] = Value::String(dpid.to_string());
        }
        Self {
            kind: EventKind::ChannelDown,
            conn_id: Some(conn_id),
            datapath_id,
            xid: None,
            body,
        }
    }

    /// The event's classification.
    #[must_use]
    pub const fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Connection the event belongs to, when datapath-scoped.
    #[must_use]
    pub const fn conn_id(&self) -> Option<u64> {
        self.conn_id
    }

    /// Datapath identifier carried by the event, when present.
    #[must_use]
    pub const fn datapath_id(&self) -> Option<DatapathId> {
        self.datapath_id
    }

    /// Transaction id carried by the event, when present.
    #[must_use]
    pub const fn xid(&self) -> Option<u32> {
        self.xid
    }

    /// The opaque event body.
    #[must_use]
    pub const fn body(&self) -> &Value {
        &self.body
    }

    /// Convenience accessor for a top-level body field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::canonical("00:00:00:00:00:00:00:01", 1)]
    #[case::high_octets("ff:00:00:00:00:00:00:00", 0xff00_0000_0000_0000)]
    #[case::bare_hex("1b2", 0x1b2)]
    #[case::prefixed("0xff", 0xff)]
    fn parses_datapath_id(#[case] input: &str, #[case] expected: u64) {
        let dpid: DatapathId = input.parse().expect("dpid should parse");
        assert_eq!(u64::from(dpid), expected);
    }

    #[rstest]
    #[case::short_group("0:00:00:00:00:00:00:01")]
    #[case::too_many_groups("00:00:00:00:00:00:00:00:01")]
    #[case::not_hex("zz:00:00:00:00:00:00:01")]
    #[case::empty("")]
    #[case::too_long("112233445566778899")]
    fn rejects_datapath_id(#[case] input: &str) {
        assert!(input.parse::<DatapathId>().is_err());
    }

    #[test]
    fn display_is_canonical() {
        let dpid = DatapathId::new(0x0102_0304_0506_0708);
        assert_eq!(dpid.to_string(), "01:02:03:04:05:06:07:08");
    }

    #[test]
    fn decodes_message_params() {
        let event = Event::from_params(json!({
            "type": "PACKET_IN",
            "conn_id": 3,
            "xid": 9,
            "datapath_id": "00:00:00:00:00:00:00:07",
            "msg": {"in_port": 1},
        }))
        .expect("event should decode");
        assert_eq!(event.kind(), &EventKind::Message("PACKET_IN".into()));
        assert_eq!(event.conn_id(), Some(3));
        assert_eq!(event.xid(), Some(9));
        assert_eq!(event.datapath_id(), Some(DatapathId::new(7)));
        assert_eq!(event.field("msg"), Some(&json!({"in_port": 1})));
    }

    #[test]
    fn discards_untyped_params() {
        assert!(Event::from_params(json!({"conn_id": 1})).is_none());
    }

    #[test]
    fn classifies_channel_events() {
        assert_eq!(EventKind::from_type("CHANNEL_UP"), EventKind::ChannelUp);
        assert_eq!(EventKind::from_type("CHANNEL_DOWN"), EventKind::ChannelDown);
        assert_eq!(
            EventKind::from_type("CHANNEL_ALERT"),
            EventKind::ChannelAlert
        );
        assert_eq!(EventKind::from_type("FLOW_REMOVED").name(), "FLOW_REMOVED");
    }
}
