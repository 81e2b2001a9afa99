//! Connection handshake: states, client properties and tuning.
//!
//! ```text
//! client                         server
//!   | -- protocol header ------->  |
//!   | <------- connection.start -- |   Start
//!   | -- connection.start-ok ---->  |   Start
//!   | <-------- connection.tune -- |
//!   | -- connection.tune-ok ----->  |
//!   | -- connection.open -------->  |   AwaitingOpenOk
//!   | <----- connection.open-ok -- |   Open
//! ```

use crate::config::{ClientIdentity, ConnectionConfig, Secret};
use crate::keepalive::negotiate_heartbeat;
use amqp_wire::{ConnectionStartOk, FieldTable, FieldValue, Tune};
use bytes::{BufMut, Bytes, BytesMut};

/// Only SASL mechanism the client implements
pub const MECHANISM_PLAIN: &str = "PLAIN";

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Protocol header sent; stays here through start-ok until connection.tune
    Start,
    /// tune-ok and open sent, waiting for open-ok
    AwaitingOpenOk,
    /// Handshake complete
    Open,
    /// Client close sent, waiting for close-ok
    Closing,
    /// Closed by either side or by the transport
    Closed,
}

impl ConnectionState {
    /// Lowercase name for errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Start => "starting",
            ConnectionState::AwaitingOpenOk => "awaiting open-ok",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Capabilities advertised in the client properties
fn capabilities() -> FieldTable {
    let mut caps = FieldTable::new();
    caps.insert("authentication_failure_close".into(), true.into());
    caps.insert("basic.nack".into(), true.into());
    caps.insert("connection.blocked".into(), false.into());
    caps.insert("consumer_cancel_notify".into(), true.into());
    caps.insert("exchange_exchange_bindings".into(), true.into());
    caps.insert("per_consumer_qos".into(), true.into());
    caps.insert("publisher_confirms".into(), true.into());
    caps
}

/// Client properties table for start-ok
pub fn client_properties(identity: &ClientIdentity) -> FieldTable {
    let mut props = FieldTable::new();
    props.insert(
        "connection_name".into(),
        identity.connection_name.as_str().into(),
    );
    props.insert("product".into(), identity.product.as_str().into());
    props.insert("information".into(), identity.information.as_str().into());
    props.insert("version".into(), identity.version.as_str().into());
    props.insert("platform".into(), identity.platform.as_str().into());
    props.insert("capabilities".into(), FieldValue::Table(capabilities()));
    props
}

/// PLAIN response: `\0username\0password`
pub fn plain_response(username: &str, password: &Secret) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + username.len() + password.expose().len());
    buf.put_u8(0);
    buf.put_slice(username.as_bytes());
    buf.put_u8(0);
    buf.put_slice(password.expose());
    buf.freeze()
}

/// Whether a space-separated mechanism list offers PLAIN
pub fn supports_plain(mechanisms: &str) -> bool {
    mechanisms
        .split_whitespace()
        .any(|mechanism| mechanism == MECHANISM_PLAIN)
}

/// Arguments of the start-ok reply
pub fn start_ok(config: &ConnectionConfig) -> ConnectionStartOk {
    ConnectionStartOk {
        client_properties: client_properties(&config.identity),
        mechanism: MECHANISM_PLAIN.to_string(),
        response: plain_response(&config.username, &config.password),
        locale: String::new(),
    }
}

/// Clamp the server's proposal to local limits.
///
/// `frame_max` is capped at the configured ceiling, and a server value of 0
/// (no limit) yields the ceiling. Heartbeat is `min(local, server)`.
pub fn negotiate(server: &Tune, config: &ConnectionConfig) -> Tune {
    let frame_max = match server.frame_max {
        0 => config.frame_max,
        proposed => proposed.min(config.frame_max),
    };
    Tune {
        channel_max: server.channel_max,
        frame_max,
        heartbeat: negotiate_heartbeat(config.heartbeat, server.heartbeat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_response() {
        let response = plain_response("guest", &Secret::from("guest"));
        assert_eq!(&response[..], b"\0guest\0guest");
    }

    #[test]
    fn test_capabilities_verbatim() {
        let props = client_properties(&ClientIdentity::default());
        let caps = match &props["capabilities"] {
            FieldValue::Table(caps) => caps,
            other => panic!("capabilities is {:?}", other),
        };

        assert_eq!(caps.len(), 7);
        assert_eq!(caps["authentication_failure_close"], FieldValue::Bool(true));
        assert_eq!(caps["basic.nack"], FieldValue::Bool(true));
        assert_eq!(caps["connection.blocked"], FieldValue::Bool(false));
        assert_eq!(caps["consumer_cancel_notify"], FieldValue::Bool(true));
        assert_eq!(caps["exchange_exchange_bindings"], FieldValue::Bool(true));
        assert_eq!(caps["per_consumer_qos"], FieldValue::Bool(true));
        assert_eq!(caps["publisher_confirms"], FieldValue::Bool(true));
        assert_eq!(
            props["product"],
            FieldValue::LongString("redb-amqp".into())
        );
    }

    #[test]
    fn test_negotiate_clamps() {
        let config = ConnectionConfig::default();
        let server = Tune {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        };
        assert_eq!(
            negotiate(&server, &config),
            Tune {
                channel_max: 2047,
                frame_max: 4096,
                heartbeat: 0,
            }
        );

        let unlimited = Tune {
            frame_max: 0,
            ..server
        };
        assert_eq!(negotiate(&unlimited, &config).frame_max, 4096);
    }

    #[test]
    fn test_supports_plain() {
        assert!(supports_plain("AMQPLAIN PLAIN"));
        assert!(!supports_plain("EXTERNAL AMQPLAIN"));
    }
}
