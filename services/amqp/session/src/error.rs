//! Session error types.

use amqp_wire::WireError;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport already closed
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced by the connection engine and the client
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Malformed or truncated protocol data
    #[error("protocol decode error: {0}")]
    Decode(#[from] WireError),

    /// Class/method pair the engine does not handle
    #[error("unsupported method {class_id}/{method_id}")]
    UnsupportedMethod {
        /// Class id
        class_id: u16,
        /// Method id
        method_id: u16,
    },

    /// Broker closed the channel
    #[error("channel {channel} closed: {code} {text}")]
    ChannelClosed {
        /// Channel id
        channel: u16,
        /// Reply code
        code: u16,
        /// Reply text
        text: String,
        /// Class of the offending method
        class_id: u16,
        /// Offending method
        method_id: u16,
    },

    /// Connection closed by the broker, the client or the transport
    #[error("connection closed: {code} {text}")]
    ConnectionClosed {
        /// Reply code, 0 for transport loss
        code: u16,
        /// Reply text
        text: String,
        /// Class of the offending method
        class_id: u16,
        /// Offending method
        method_id: u16,
    },

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel already has an outstanding request
    #[error("channel {0} already has a request in flight")]
    ChannelBusy(u16),

    /// No such channel
    #[error("channel {0} not found")]
    ChannelNotFound(u16),

    /// Requested channel id is taken
    #[error("channel {0} already in use")]
    ChannelInUse(u16),

    /// Channel id out of range
    #[error("invalid channel id {0}")]
    InvalidChannel(u16),

    /// Every channel id up to channel-max is taken
    #[error("no free channel id")]
    NoFreeChannel,

    /// Operation not allowed in the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Current state
        state: &'static str,
        /// Attempted operation
        operation: &'static str,
    },

    /// Reply did not match the request
    #[error("unexpected reply, wanted {0}")]
    UnexpectedReply(&'static str),

    /// Engine dropped the request without answering
    #[error("request dropped")]
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AmqpError::ChannelClosed {
            channel: 3,
            code: 404,
            text: "NOT_FOUND".into(),
            class_id: 50,
            method_id: 10,
        };
        assert_eq!(err.to_string(), "channel 3 closed: 404 NOT_FOUND");

        let err = AmqpError::InvalidState {
            state: "closing",
            operation: "channel.open",
        };
        assert_eq!(err.to_string(), "cannot channel.open while closing");
    }

    #[test]
    fn test_wire_error_converts() {
        let err: AmqpError = WireError::Incomplete.into();
        assert!(matches!(err, AmqpError::Decode(WireError::Incomplete)));
    }
}
