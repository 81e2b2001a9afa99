//! Connection configuration and client identity.

use amqp_wire::{DEFAULT_MAX_FRAME_SIZE, FRAME_MIN_SIZE};
use std::fmt;

/// Credential bytes that never show up in `Debug` output or logs
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap raw secret bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw bytes, for building the authentication response only
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

/// How the client presents itself in `connection.start-ok`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Name shown in the broker's connection list
    pub connection_name: String,
    /// Client product name
    pub product: String,
    /// Client version
    pub version: String,
    /// Runtime platform
    pub platform: String,
    /// Free-form information, usually a URL
    pub information: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            connection_name: "redb-amqp".to_string(),
            product: "redb-amqp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: format!("Rust/{}", std::env::consts::OS),
            information: "https://github.com/redbco/redb-open".to_string(),
        }
    }
}

/// Configuration for one broker connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Virtual host to open
    pub vhost: String,
    /// PLAIN username
    pub username: String,
    /// PLAIN password
    pub password: Secret,
    /// Client properties sent at start-ok
    pub identity: ClientIdentity,
    /// Upper bound on the negotiated frame size
    pub frame_max: u32,
    /// Requested heartbeat in seconds; the negotiated value is the smaller
    /// of this and the server's, so 0 disables heartbeats
    pub heartbeat: u16,
    /// Largest inbound frame payload accepted before the stream is treated
    /// as out of sync
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: Secret::from("guest"),
            identity: ClientIdentity::default(),
            frame_max: FRAME_MIN_SIZE as u32,
            heartbeat: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let config = ConnectionConfig {
            password: Secret::from("hunter2"),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Secret(<redacted>)"));
        assert_eq!(config.password.expose(), b"hunter2");
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.vhost, "/");
        assert_eq!(config.frame_max, 4096);
        assert_eq!(config.heartbeat, 0);
        assert_eq!(config.identity.product, "redb-amqp");
    }
}
