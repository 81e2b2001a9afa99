//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer ended before the value was complete
    #[error("incomplete frame")]
    Incomplete,

    /// Declared size exceeds the configured limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Frame-end marker was not 0xCE
    #[error("invalid frame end byte 0x{0:02X}")]
    FrameEnd(u8),

    /// Unknown frame type
    #[error("unknown frame type {0}")]
    Type(u8),

    /// Short string longer than 255 bytes
    #[error("short string too long: {0} bytes")]
    ShortStringTooLong(usize),

    /// Unknown field value tag in a table or array
    #[error("unknown field type tag 0x{0:02X}")]
    FieldType(u8),

    /// Class/method pair this codec does not understand
    #[error("unsupported class/method {class_id}/{method_id}")]
    UnknownMethod {
        /// Class id
        class_id: u16,
        /// Method id
        method_id: u16,
    },

    /// Structurally invalid content
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
