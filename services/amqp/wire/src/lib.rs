//! AMQP 0-9-1 wire protocol: primitives, field tables, frames, methods and
//! content properties.
//!
//! This crate is pure encoding and decoding. It never touches a socket and
//! never blocks; the session crate feeds it bytes and sends what it builds.
//!
//! ## Wire Format
//!
//! ```text
//! +---------+-------------+-----------+------------------+-----------+
//! | type u8 | channel u16 | size u32  | payload[size]    | end 0xCE  |
//! +---------+-------------+-----------+------------------+-----------+
//!
//! method  (1): class u16 | method u16 | arguments
//! header  (2): class u16 | weight u16 | body size u64 | flags u16 | properties
//! body    (3): raw content bytes
//! heartbeat (8): empty, channel 0
//! ```
//!
//! Integers are big-endian. Short strings carry a 1-byte length, long
//! strings and tables a 4-byte length.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod method;
pub mod properties;
pub mod table;

// Re-export main types
pub use codec::SHORT_STRING_MAX;
pub use error::WireError;
pub use frame::{
    Frame, FrameDecoder, FrameType, FrameWriter, DEFAULT_MAX_FRAME_SIZE, FRAME_END,
    FRAME_HEADER_SIZE, FRAME_MIN_SIZE, FRAME_OVERHEAD, PROTOCOL_HEADER,
};
pub use method::{
    BasicConsume, BasicPublish, ClassId, Close, ConnectionStart, ConnectionStartOk, Deliver,
    ExchangeDeclare, Method, MethodId, QueueBind, QueueDeclare, QueueDeclareOk, Tune,
};
pub use properties::{BasicProperties, ContentHeader, PropertyFlags};
pub use table::{FieldTable, FieldValue};
