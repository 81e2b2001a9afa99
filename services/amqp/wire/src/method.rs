//! Method frames: class/method ids and their argument layouts.
//!
//! [`Method`] covers every method the client sends or must understand, in
//! both directions, so the same codec serves the engine and test peers.
//! Decoding is a two-level match on class id, then method id; anything else
//! is [`WireError::UnknownMethod`].

use crate::codec::{
    bit, get_long_string, get_short_string, get_u16, get_u32, get_u64, get_u8, pack_bits,
    put_long_string, put_short_string,
};
use crate::frame::FrameWriter;
use crate::table::{get_table, put_table, FieldTable};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Method classes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassId {
    /// Connection negotiation and teardown
    Connection = 10,
    /// Channel lifecycle
    Channel = 20,
    /// Exchange management
    Exchange = 40,
    /// Queue management
    Queue = 50,
    /// Basic content class
    Basic = 60,
    /// Publisher confirms (RabbitMQ extension)
    Confirm = 85,
}

impl TryFrom<u16> for ClassId {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(ClassId::Connection),
            20 => Ok(ClassId::Channel),
            40 => Ok(ClassId::Exchange),
            50 => Ok(ClassId::Queue),
            60 => Ok(ClassId::Basic),
            85 => Ok(ClassId::Confirm),
            other => Err(other),
        }
    }
}

/// Connection class method ids
pub mod connection {
    #![allow(missing_docs)]
    pub const START: u16 = 10;
    pub const START_OK: u16 = 11;
    pub const TUNE: u16 = 30;
    pub const TUNE_OK: u16 = 31;
    pub const OPEN: u16 = 40;
    pub const OPEN_OK: u16 = 41;
    pub const CLOSE: u16 = 50;
    pub const CLOSE_OK: u16 = 51;
}

/// Channel class method ids
pub mod channel {
    #![allow(missing_docs)]
    pub const OPEN: u16 = 10;
    pub const OPEN_OK: u16 = 11;
    pub const CLOSE: u16 = 40;
    pub const CLOSE_OK: u16 = 41;
}

/// Exchange class method ids
pub mod exchange {
    #![allow(missing_docs)]
    pub const DECLARE: u16 = 10;
    pub const DECLARE_OK: u16 = 11;
    pub const DELETE: u16 = 20;
    pub const DELETE_OK: u16 = 21;
}

/// Queue class method ids
pub mod queue {
    #![allow(missing_docs)]
    pub const DECLARE: u16 = 10;
    pub const DECLARE_OK: u16 = 11;
    pub const BIND: u16 = 20;
    pub const BIND_OK: u16 = 21;
    pub const PURGE: u16 = 30;
    pub const PURGE_OK: u16 = 31;
    pub const DELETE: u16 = 40;
    pub const DELETE_OK: u16 = 41;
    pub const UNBIND: u16 = 50;
    pub const UNBIND_OK: u16 = 51;
}

/// Basic class method ids
pub mod basic {
    #![allow(missing_docs)]
    pub const QOS: u16 = 10;
    pub const QOS_OK: u16 = 11;
    pub const CONSUME: u16 = 20;
    pub const CONSUME_OK: u16 = 21;
    pub const CANCEL: u16 = 30;
    pub const CANCEL_OK: u16 = 31;
    pub const PUBLISH: u16 = 40;
    pub const DELIVER: u16 = 60;
    pub const ACK: u16 = 80;
    pub const REJECT: u16 = 90;
    pub const NACK: u16 = 120;
}

/// Confirm class method ids
pub mod confirm {
    #![allow(missing_docs)]
    pub const SELECT: u16 = 10;
    pub const SELECT_OK: u16 = 11;
}

/// connection.start arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStart {
    /// Protocol major version
    pub version_major: u8,
    /// Protocol minor version
    pub version_minor: u8,
    /// Broker identity and capabilities
    pub server_properties: FieldTable,
    /// Space-separated SASL mechanisms
    pub mechanisms: String,
    /// Space-separated locales
    pub locales: String,
}

/// connection.start-ok arguments
#[derive(Clone, PartialEq)]
pub struct ConnectionStartOk {
    /// Client identity and capabilities
    pub client_properties: FieldTable,
    /// Selected SASL mechanism
    pub mechanism: String,
    /// SASL response; holds credentials
    pub response: Bytes,
    /// Selected locale
    pub locale: String,
}

impl fmt::Debug for ConnectionStartOk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStartOk")
            .field("client_properties", &self.client_properties)
            .field("mechanism", &self.mechanism)
            .field("response", &"<redacted>")
            .field("locale", &self.locale)
            .finish()
    }
}

/// connection.tune / tune-ok arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tune {
    /// Highest usable channel id, 0 = no limit
    pub channel_max: u16,
    /// Largest frame size, 0 = no limit
    pub frame_max: u32,
    /// Heartbeat interval in seconds, 0 = off
    pub heartbeat: u16,
}

/// connection.close / channel.close arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Close {
    /// Reply code (200 = normal)
    pub reply_code: u16,
    /// Human readable reason
    pub reply_text: String,
    /// Class of the method that caused the close, 0 if none
    pub class_id: u16,
    /// Method that caused the close, 0 if none
    pub method_id: u16,
}

/// exchange.declare arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExchangeDeclare {
    /// Exchange name
    pub exchange: String,
    /// Exchange type (direct, fanout, topic, headers)
    pub kind: String,
    /// Only check that the exchange exists
    pub passive: bool,
    /// Survive broker restart
    pub durable: bool,
    /// Delete when the last binding goes
    pub auto_delete: bool,
    /// Not publishable by clients
    pub internal: bool,
    /// Broker-specific arguments
    pub arguments: FieldTable,
}

impl ExchangeDeclare {
    /// Declare `exchange` of type `kind` with default flags
    pub fn new(exchange: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }
}

/// queue.declare arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueDeclare {
    /// Queue name, empty for a server-named queue
    pub queue: String,
    /// Only check that the queue exists
    pub passive: bool,
    /// Survive broker restart
    pub durable: bool,
    /// Owned by this connection
    pub exclusive: bool,
    /// Delete when the last consumer goes
    pub auto_delete: bool,
    /// Broker-specific arguments
    pub arguments: FieldTable,
}

impl QueueDeclare {
    /// Declare `queue` with default flags
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }
}

/// queue.declare-ok arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDeclareOk {
    /// Queue name (server-generated if requested empty)
    pub queue: String,
    /// Messages ready in the queue
    pub message_count: u32,
    /// Active consumers
    pub consumer_count: u32,
}

/// queue.bind / queue.unbind arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueBind {
    /// Queue name
    pub queue: String,
    /// Exchange name
    pub exchange: String,
    /// Binding key
    pub routing_key: String,
    /// Broker-specific arguments
    pub arguments: FieldTable,
}

impl QueueBind {
    /// Bind `queue` to `exchange` with `routing_key`
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            arguments: FieldTable::new(),
        }
    }
}

/// basic.consume arguments
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasicConsume {
    /// Queue to consume from
    pub queue: String,
    /// Consumer tag, empty for a server-generated one
    pub consumer_tag: String,
    /// Do not receive own publishes
    pub no_local: bool,
    /// Deliveries need no acknowledgement
    pub no_ack: bool,
    /// Only consumer on the queue
    pub exclusive: bool,
    /// Broker-specific arguments
    pub arguments: FieldTable,
}

impl BasicConsume {
    /// Consume `queue` with a server-generated tag
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }
}

/// basic.publish arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BasicPublish {
    /// Target exchange, empty for the default exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Return the message if unroutable
    pub mandatory: bool,
    /// Return the message if no consumer is ready
    pub immediate: bool,
}

/// basic.deliver arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deliver {
    /// Consumer the message is for
    pub consumer_tag: String,
    /// Channel-scoped delivery tag
    pub delivery_tag: u64,
    /// Message was delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish
    pub routing_key: String,
}

/// Class/method identifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    /// Class id
    pub class_id: u16,
    /// Method id
    pub method_id: u16,
}

impl MethodId {
    /// Whether `self` is the synchronous `-ok` to `request`: same class,
    /// next method id
    pub fn answers(&self, request: MethodId) -> bool {
        self.class_id == request.class_id
            && request.method_id.checked_add(1) == Some(self.method_id)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_id, self.method_id)
    }
}

/// A decoded or to-be-encoded method
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// connection.start
    ConnectionStart(ConnectionStart),
    /// connection.start-ok
    ConnectionStartOk(ConnectionStartOk),
    /// connection.tune
    ConnectionTune(Tune),
    /// connection.tune-ok
    ConnectionTuneOk(Tune),
    /// connection.open
    ConnectionOpen {
        /// Virtual host
        vhost: String,
    },
    /// connection.open-ok
    ConnectionOpenOk,
    /// connection.close
    ConnectionClose(Close),
    /// connection.close-ok
    ConnectionCloseOk,
    /// channel.open
    ChannelOpen,
    /// channel.open-ok
    ChannelOpenOk,
    /// channel.close
    ChannelClose(Close),
    /// channel.close-ok
    ChannelCloseOk,
    /// exchange.declare
    ExchangeDeclare(ExchangeDeclare),
    /// exchange.declare-ok
    ExchangeDeclareOk,
    /// exchange.delete
    ExchangeDelete {
        /// Exchange name
        exchange: String,
        /// Only delete if unused
        if_unused: bool,
    },
    /// exchange.delete-ok
    ExchangeDeleteOk,
    /// queue.declare
    QueueDeclare(QueueDeclare),
    /// queue.declare-ok
    QueueDeclareOk(QueueDeclareOk),
    /// queue.bind
    QueueBind(QueueBind),
    /// queue.bind-ok
    QueueBindOk,
    /// queue.purge
    QueuePurge {
        /// Queue name
        queue: String,
    },
    /// queue.purge-ok
    QueuePurgeOk {
        /// Messages purged
        message_count: u32,
    },
    /// queue.delete
    QueueDelete {
        /// Queue name
        queue: String,
        /// Only delete if no consumers
        if_unused: bool,
        /// Only delete if empty
        if_empty: bool,
    },
    /// queue.delete-ok
    QueueDeleteOk {
        /// Messages deleted with the queue
        message_count: u32,
    },
    /// queue.unbind
    QueueUnbind(QueueBind),
    /// queue.unbind-ok
    QueueUnbindOk,
    /// basic.qos
    BasicQos {
        /// Prefetch window in octets, 0 = no limit
        prefetch_size: u32,
        /// Prefetch window in messages, 0 = no limit
        prefetch_count: u16,
        /// Apply to the whole channel rather than per consumer
        global: bool,
    },
    /// basic.qos-ok
    BasicQosOk,
    /// basic.consume
    BasicConsume(BasicConsume),
    /// basic.consume-ok
    BasicConsumeOk {
        /// Consumer tag
        consumer_tag: String,
    },
    /// basic.cancel (client request or broker notification)
    BasicCancel {
        /// Consumer tag
        consumer_tag: String,
        /// Sender expects no reply
        no_wait: bool,
    },
    /// basic.cancel-ok
    BasicCancelOk {
        /// Consumer tag
        consumer_tag: String,
    },
    /// basic.publish
    BasicPublish(BasicPublish),
    /// basic.deliver
    BasicDeliver(Deliver),
    /// basic.ack
    BasicAck {
        /// Delivery or publish sequence tag
        delivery_tag: u64,
        /// Covers every tag up to and including this one
        multiple: bool,
    },
    /// basic.reject
    BasicReject {
        /// Delivery tag
        delivery_tag: u64,
        /// Put the message back on the queue
        requeue: bool,
    },
    /// basic.nack
    BasicNack {
        /// Delivery or publish sequence tag
        delivery_tag: u64,
        /// Covers every tag up to and including this one
        multiple: bool,
        /// Put the message back on the queue
        requeue: bool,
    },
    /// confirm.select
    ConfirmSelect,
    /// confirm.select-ok
    ConfirmSelectOk,
}

impl Method {
    /// Class/method ids of this method
    pub fn id(&self) -> MethodId {
        let (class_id, method_id, _) = self.describe();
        MethodId {
            class_id,
            method_id,
        }
    }

    /// Dotted protocol name, e.g. `queue.declare-ok`
    pub fn name(&self) -> &'static str {
        self.describe().2
    }

    fn describe(&self) -> (u16, u16, &'static str) {
        use ClassId::*;
        let (class, method, name) = match self {
            Method::ConnectionStart(_) => (Connection, connection::START, "connection.start"),
            Method::ConnectionStartOk(_) => {
                (Connection, connection::START_OK, "connection.start-ok")
            }
            Method::ConnectionTune(_) => (Connection, connection::TUNE, "connection.tune"),
            Method::ConnectionTuneOk(_) => (Connection, connection::TUNE_OK, "connection.tune-ok"),
            Method::ConnectionOpen { .. } => (Connection, connection::OPEN, "connection.open"),
            Method::ConnectionOpenOk => (Connection, connection::OPEN_OK, "connection.open-ok"),
            Method::ConnectionClose(_) => (Connection, connection::CLOSE, "connection.close"),
            Method::ConnectionCloseOk => (Connection, connection::CLOSE_OK, "connection.close-ok"),
            Method::ChannelOpen => (Channel, channel::OPEN, "channel.open"),
            Method::ChannelOpenOk => (Channel, channel::OPEN_OK, "channel.open-ok"),
            Method::ChannelClose(_) => (Channel, channel::CLOSE, "channel.close"),
            Method::ChannelCloseOk => (Channel, channel::CLOSE_OK, "channel.close-ok"),
            Method::ExchangeDeclare(_) => (Exchange, exchange::DECLARE, "exchange.declare"),
            Method::ExchangeDeclareOk => (Exchange, exchange::DECLARE_OK, "exchange.declare-ok"),
            Method::ExchangeDelete { .. } => (Exchange, exchange::DELETE, "exchange.delete"),
            Method::ExchangeDeleteOk => (Exchange, exchange::DELETE_OK, "exchange.delete-ok"),
            Method::QueueDeclare(_) => (Queue, queue::DECLARE, "queue.declare"),
            Method::QueueDeclareOk(_) => (Queue, queue::DECLARE_OK, "queue.declare-ok"),
            Method::QueueBind(_) => (Queue, queue::BIND, "queue.bind"),
            Method::QueueBindOk => (Queue, queue::BIND_OK, "queue.bind-ok"),
            Method::QueuePurge { .. } => (Queue, queue::PURGE, "queue.purge"),
            Method::QueuePurgeOk { .. } => (Queue, queue::PURGE_OK, "queue.purge-ok"),
            Method::QueueDelete { .. } => (Queue, queue::DELETE, "queue.delete"),
            Method::QueueDeleteOk { .. } => (Queue, queue::DELETE_OK, "queue.delete-ok"),
            Method::QueueUnbind(_) => (Queue, queue::UNBIND, "queue.unbind"),
            Method::QueueUnbindOk => (Queue, queue::UNBIND_OK, "queue.unbind-ok"),
            Method::BasicQos { .. } => (Basic, basic::QOS, "basic.qos"),
            Method::BasicQosOk => (Basic, basic::QOS_OK, "basic.qos-ok"),
            Method::BasicConsume(_) => (Basic, basic::CONSUME, "basic.consume"),
            Method::BasicConsumeOk { .. } => (Basic, basic::CONSUME_OK, "basic.consume-ok"),
            Method::BasicCancel { .. } => (Basic, basic::CANCEL, "basic.cancel"),
            Method::BasicCancelOk { .. } => (Basic, basic::CANCEL_OK, "basic.cancel-ok"),
            Method::BasicPublish(_) => (Basic, basic::PUBLISH, "basic.publish"),
            Method::BasicDeliver(_) => (Basic, basic::DELIVER, "basic.deliver"),
            Method::BasicAck { .. } => (Basic, basic::ACK, "basic.ack"),
            Method::BasicReject { .. } => (Basic, basic::REJECT, "basic.reject"),
            Method::BasicNack { .. } => (Basic, basic::NACK, "basic.nack"),
            Method::ConfirmSelect => (Confirm, confirm::SELECT, "confirm.select"),
            Method::ConfirmSelectOk => (Confirm, confirm::SELECT_OK, "confirm.select-ok"),
        };
        (class as u16, method, name)
    }

    /// Decode a method frame payload (class id and method id included)
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        let class_id = get_u16(&mut payload)?;
        let method_id = get_u16(&mut payload)?;
        let unknown = WireError::UnknownMethod {
            class_id,
            method_id,
        };
        let class = ClassId::try_from(class_id).map_err(|_| unknown.clone())?;
        let buf = &mut payload;

        let method = match class {
            ClassId::Connection => match method_id {
                connection::START => Method::ConnectionStart(ConnectionStart {
                    version_major: get_u8(buf)?,
                    version_minor: get_u8(buf)?,
                    server_properties: get_table(buf)?,
                    mechanisms: lossy(get_long_string(buf)?),
                    locales: lossy(get_long_string(buf)?),
                }),
                connection::START_OK => Method::ConnectionStartOk(ConnectionStartOk {
                    client_properties: get_table(buf)?,
                    mechanism: get_short_string(buf)?,
                    response: get_long_string(buf)?,
                    locale: get_short_string(buf)?,
                }),
                connection::TUNE => Method::ConnectionTune(get_tune(buf)?),
                connection::TUNE_OK => Method::ConnectionTuneOk(get_tune(buf)?),
                connection::OPEN => {
                    let vhost = get_short_string(buf)?;
                    let _capabilities = get_short_string(buf)?;
                    let _insist = get_u8(buf)?;
                    Method::ConnectionOpen { vhost }
                }
                connection::OPEN_OK => {
                    let _known_hosts = get_short_string(buf)?;
                    Method::ConnectionOpenOk
                }
                connection::CLOSE => Method::ConnectionClose(get_close(buf)?),
                connection::CLOSE_OK => Method::ConnectionCloseOk,
                _ => return Err(unknown),
            },
            ClassId::Channel => match method_id {
                channel::OPEN => {
                    let _out_of_band = get_short_string(buf)?;
                    Method::ChannelOpen
                }
                channel::OPEN_OK => {
                    let _channel_id = get_long_string(buf)?;
                    Method::ChannelOpenOk
                }
                channel::CLOSE => Method::ChannelClose(get_close(buf)?),
                channel::CLOSE_OK => Method::ChannelCloseOk,
                _ => return Err(unknown),
            },
            ClassId::Exchange => match method_id {
                exchange::DECLARE => {
                    let _ticket = get_u16(buf)?;
                    let exchange = get_short_string(buf)?;
                    let kind = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::ExchangeDeclare(ExchangeDeclare {
                        exchange,
                        kind,
                        passive: bit(bits, 0),
                        durable: bit(bits, 1),
                        auto_delete: bit(bits, 2),
                        internal: bit(bits, 3),
                        arguments: get_table(buf)?,
                    })
                }
                exchange::DECLARE_OK => Method::ExchangeDeclareOk,
                exchange::DELETE => {
                    let _ticket = get_u16(buf)?;
                    let exchange = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::ExchangeDelete {
                        exchange,
                        if_unused: bit(bits, 0),
                    }
                }
                exchange::DELETE_OK => Method::ExchangeDeleteOk,
                _ => return Err(unknown),
            },
            ClassId::Queue => match method_id {
                queue::DECLARE => {
                    let _ticket = get_u16(buf)?;
                    let queue = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::QueueDeclare(QueueDeclare {
                        queue,
                        passive: bit(bits, 0),
                        durable: bit(bits, 1),
                        exclusive: bit(bits, 2),
                        auto_delete: bit(bits, 3),
                        arguments: get_table(buf)?,
                    })
                }
                queue::DECLARE_OK => Method::QueueDeclareOk(QueueDeclareOk {
                    queue: get_short_string(buf)?,
                    message_count: get_u32(buf)?,
                    consumer_count: get_u32(buf)?,
                }),
                queue::BIND => {
                    let _ticket = get_u16(buf)?;
                    let queue = get_short_string(buf)?;
                    let exchange = get_short_string(buf)?;
                    let routing_key = get_short_string(buf)?;
                    let _no_wait = get_u8(buf)?;
                    Method::QueueBind(QueueBind {
                        queue,
                        exchange,
                        routing_key,
                        arguments: get_table(buf)?,
                    })
                }
                queue::BIND_OK => Method::QueueBindOk,
                queue::PURGE => {
                    let _ticket = get_u16(buf)?;
                    let queue = get_short_string(buf)?;
                    let _no_wait = get_u8(buf)?;
                    Method::QueuePurge { queue }
                }
                queue::PURGE_OK => Method::QueuePurgeOk {
                    message_count: get_u32(buf)?,
                },
                queue::DELETE => {
                    let _ticket = get_u16(buf)?;
                    let queue = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::QueueDelete {
                        queue,
                        if_unused: bit(bits, 0),
                        if_empty: bit(bits, 1),
                    }
                }
                queue::DELETE_OK => Method::QueueDeleteOk {
                    message_count: get_u32(buf)?,
                },
                queue::UNBIND => {
                    let _ticket = get_u16(buf)?;
                    Method::QueueUnbind(QueueBind {
                        queue: get_short_string(buf)?,
                        exchange: get_short_string(buf)?,
                        routing_key: get_short_string(buf)?,
                        arguments: get_table(buf)?,
                    })
                }
                queue::UNBIND_OK => Method::QueueUnbindOk,
                _ => return Err(unknown),
            },
            ClassId::Basic => match method_id {
                basic::QOS => Method::BasicQos {
                    prefetch_size: get_u32(buf)?,
                    prefetch_count: get_u16(buf)?,
                    global: bit(get_u8(buf)?, 0),
                },
                basic::QOS_OK => Method::BasicQosOk,
                basic::CONSUME => {
                    let _ticket = get_u16(buf)?;
                    let queue = get_short_string(buf)?;
                    let consumer_tag = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::BasicConsume(BasicConsume {
                        queue,
                        consumer_tag,
                        no_local: bit(bits, 0),
                        no_ack: bit(bits, 1),
                        exclusive: bit(bits, 2),
                        arguments: get_table(buf)?,
                    })
                }
                basic::CONSUME_OK => Method::BasicConsumeOk {
                    consumer_tag: get_short_string(buf)?,
                },
                basic::CANCEL => Method::BasicCancel {
                    consumer_tag: get_short_string(buf)?,
                    no_wait: bit(get_u8(buf)?, 0),
                },
                basic::CANCEL_OK => Method::BasicCancelOk {
                    consumer_tag: get_short_string(buf)?,
                },
                basic::PUBLISH => {
                    let _ticket = get_u16(buf)?;
                    let exchange = get_short_string(buf)?;
                    let routing_key = get_short_string(buf)?;
                    let bits = get_u8(buf)?;
                    Method::BasicPublish(BasicPublish {
                        exchange,
                        routing_key,
                        mandatory: bit(bits, 0),
                        immediate: bit(bits, 1),
                    })
                }
                basic::DELIVER => Method::BasicDeliver(Deliver {
                    consumer_tag: get_short_string(buf)?,
                    delivery_tag: get_u64(buf)?,
                    redelivered: bit(get_u8(buf)?, 0),
                    exchange: get_short_string(buf)?,
                    routing_key: get_short_string(buf)?,
                }),
                basic::ACK => Method::BasicAck {
                    delivery_tag: get_u64(buf)?,
                    multiple: bit(get_u8(buf)?, 0),
                },
                basic::REJECT => Method::BasicReject {
                    delivery_tag: get_u64(buf)?,
                    requeue: bit(get_u8(buf)?, 0),
                },
                basic::NACK => {
                    let delivery_tag = get_u64(buf)?;
                    let bits = get_u8(buf)?;
                    Method::BasicNack {
                        delivery_tag,
                        multiple: bit(bits, 0),
                        requeue: bit(bits, 1),
                    }
                }
                _ => return Err(unknown),
            },
            ClassId::Confirm => match method_id {
                confirm::SELECT => {
                    let _no_wait = get_u8(buf)?;
                    Method::ConfirmSelect
                }
                confirm::SELECT_OK => Method::ConfirmSelectOk,
                _ => return Err(unknown),
            },
        };

        Ok(method)
    }

    /// Encode as a complete method frame on `channel`.
    ///
    /// No-wait bits are always clear: the engine waits for every reply.
    pub fn encode(&self, channel: u16, frame_max: usize) -> Result<Bytes, WireError> {
        let id = self.id();
        let mut frame = FrameWriter::method(channel, id.class_id, id.method_id);
        let buf = frame.buf_mut();

        match self {
            Method::ConnectionStart(start) => {
                buf.put_u8(start.version_major);
                buf.put_u8(start.version_minor);
                put_table(buf, &start.server_properties)?;
                put_long_string(buf, start.mechanisms.as_bytes())?;
                put_long_string(buf, start.locales.as_bytes())?;
            }
            Method::ConnectionStartOk(start_ok) => {
                put_table(buf, &start_ok.client_properties)?;
                put_short_string(buf, &start_ok.mechanism)?;
                put_long_string(buf, &start_ok.response)?;
                put_short_string(buf, &start_ok.locale)?;
            }
            Method::ConnectionTune(tune) | Method::ConnectionTuneOk(tune) => {
                buf.put_u16(tune.channel_max);
                buf.put_u32(tune.frame_max);
                buf.put_u16(tune.heartbeat);
            }
            Method::ConnectionOpen { vhost } => {
                put_short_string(buf, vhost)?;
                put_short_string(buf, "")?;
                buf.put_u8(0);
            }
            Method::ConnectionOpenOk => {
                put_short_string(buf, "")?;
            }
            Method::ConnectionClose(close) | Method::ChannelClose(close) => {
                put_close(buf, close)?;
            }
            Method::ChannelOpen => {
                put_short_string(buf, "")?;
            }
            Method::ChannelOpenOk => {
                put_long_string(buf, b"")?;
            }
            Method::ExchangeDeclare(declare) => {
                buf.put_u16(0);
                put_short_string(buf, &declare.exchange)?;
                put_short_string(buf, &declare.kind)?;
                buf.put_u8(pack_bits(&[
                    declare.passive,
                    declare.durable,
                    declare.auto_delete,
                    declare.internal,
                    false,
                ]));
                put_table(buf, &declare.arguments)?;
            }
            Method::ExchangeDelete {
                exchange,
                if_unused,
            } => {
                buf.put_u16(0);
                put_short_string(buf, exchange)?;
                buf.put_u8(pack_bits(&[*if_unused, false]));
            }
            Method::QueueDeclare(declare) => {
                buf.put_u16(0);
                put_short_string(buf, &declare.queue)?;
                buf.put_u8(pack_bits(&[
                    declare.passive,
                    declare.durable,
                    declare.exclusive,
                    declare.auto_delete,
                    false,
                ]));
                put_table(buf, &declare.arguments)?;
            }
            Method::QueueDeclareOk(ok) => {
                put_short_string(buf, &ok.queue)?;
                buf.put_u32(ok.message_count);
                buf.put_u32(ok.consumer_count);
            }
            Method::QueueBind(bind) => {
                buf.put_u16(0);
                put_short_string(buf, &bind.queue)?;
                put_short_string(buf, &bind.exchange)?;
                put_short_string(buf, &bind.routing_key)?;
                buf.put_u8(0);
                put_table(buf, &bind.arguments)?;
            }
            Method::QueuePurge { queue } => {
                buf.put_u16(0);
                put_short_string(buf, queue)?;
                buf.put_u8(0);
            }
            Method::QueuePurgeOk { message_count } | Method::QueueDeleteOk { message_count } => {
                buf.put_u32(*message_count);
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
            } => {
                buf.put_u16(0);
                put_short_string(buf, queue)?;
                buf.put_u8(pack_bits(&[*if_unused, *if_empty, false]));
            }
            Method::QueueUnbind(unbind) => {
                buf.put_u16(0);
                put_short_string(buf, &unbind.queue)?;
                put_short_string(buf, &unbind.exchange)?;
                put_short_string(buf, &unbind.routing_key)?;
                put_table(buf, &unbind.arguments)?;
            }
            Method::BasicQos {
                prefetch_size,
                prefetch_count,
                global,
            } => {
                buf.put_u32(*prefetch_size);
                buf.put_u16(*prefetch_count);
                buf.put_u8(pack_bits(&[*global]));
            }
            Method::BasicConsume(consume) => {
                buf.put_u16(0);
                put_short_string(buf, &consume.queue)?;
                put_short_string(buf, &consume.consumer_tag)?;
                buf.put_u8(pack_bits(&[
                    consume.no_local,
                    consume.no_ack,
                    consume.exclusive,
                    false,
                ]));
                put_table(buf, &consume.arguments)?;
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
                put_short_string(buf, consumer_tag)?;
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                put_short_string(buf, consumer_tag)?;
                buf.put_u8(pack_bits(&[*no_wait]));
            }
            Method::BasicPublish(publish) => {
                buf.put_u16(0);
                put_short_string(buf, &publish.exchange)?;
                put_short_string(buf, &publish.routing_key)?;
                buf.put_u8(pack_bits(&[publish.mandatory, publish.immediate]));
            }
            Method::BasicDeliver(deliver) => {
                put_short_string(buf, &deliver.consumer_tag)?;
                buf.put_u64(deliver.delivery_tag);
                buf.put_u8(pack_bits(&[deliver.redelivered]));
                put_short_string(buf, &deliver.exchange)?;
                put_short_string(buf, &deliver.routing_key)?;
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*multiple]));
            }
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*requeue]));
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(pack_bits(&[*multiple, *requeue]));
            }
            Method::ConfirmSelect => {
                buf.put_u8(0);
            }
            Method::ConnectionCloseOk
            | Method::ChannelCloseOk
            | Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::BasicQosOk
            | Method::ConfirmSelectOk => {}
        }

        frame.finish(frame_max)
    }
}

fn lossy(raw: Bytes) -> String {
    String::from_utf8_lossy(&raw).into_owned()
}

fn get_tune(buf: &mut Bytes) -> Result<Tune, WireError> {
    Ok(Tune {
        channel_max: get_u16(buf)?,
        frame_max: get_u32(buf)?,
        heartbeat: get_u16(buf)?,
    })
}

fn get_close(buf: &mut Bytes) -> Result<Close, WireError> {
    Ok(Close {
        reply_code: get_u16(buf)?,
        reply_text: get_short_string(buf)?,
        class_id: get_u16(buf)?,
        method_id: get_u16(buf)?,
    })
}

fn put_close(buf: &mut BytesMut, close: &Close) -> Result<(), WireError> {
    buf.put_u16(close.reply_code);
    put_short_string(buf, &close.reply_text)?;
    buf.put_u16(close.class_id);
    buf.put_u16(close.method_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, FrameType, FRAME_HEADER_SIZE};
    use crate::table::FieldValue;

    fn reencode(method: &Method) -> Method {
        let bytes = method.encode(7, 4096).unwrap();
        let mut buf = BytesMut::from(bytes.as_ref());
        let frame = FrameDecoder::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.typ, FrameType::Method);
        assert_eq!(frame.channel, 7);
        Method::decode(frame.payload).unwrap()
    }

    #[test]
    fn test_close_layout() {
        let close = Method::ChannelClose(Close {
            reply_code: 404,
            reply_text: "NOT_FOUND".into(),
            class_id: 50,
            method_id: 10,
        });
        let bytes = close.encode(3, 4096).unwrap();

        // class 20, method 40, code 404
        assert_eq!(
            &bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 6],
            &[0, 20, 0, 40, 1, 148]
        );
        assert_eq!(reencode(&close), close);
    }

    #[test]
    fn test_queue_declare_ok_decode() {
        let ok = Method::QueueDeclareOk(QueueDeclareOk {
            queue: "orders".into(),
            message_count: 0,
            consumer_count: 0,
        });
        assert_eq!(reencode(&ok), ok);
        assert_eq!(ok.name(), "queue.declare-ok");
        assert_eq!(ok.id().to_string(), "50/11");
    }

    #[test]
    fn test_client_methods_reencode() {
        let mut args = FieldTable::new();
        args.insert("x-message-ttl".into(), FieldValue::LongInt(60_000));

        let methods = vec![
            Method::ConnectionOpen {
                vhost: "/".into(),
            },
            Method::ConnectionTuneOk(Tune {
                channel_max: 2047,
                frame_max: 4096,
                heartbeat: 0,
            }),
            Method::ExchangeDeclare(ExchangeDeclare {
                durable: true,
                ..ExchangeDeclare::new("events", "topic")
            }),
            Method::QueueDeclare(QueueDeclare {
                durable: true,
                arguments: args,
                ..QueueDeclare::new("orders")
            }),
            Method::QueueBind(QueueBind::new("orders", "events", "order.*")),
            Method::QueueUnbind(QueueBind::new("orders", "events", "order.*")),
            Method::QueueDelete {
                queue: "orders".into(),
                if_unused: true,
                if_empty: false,
            },
            Method::BasicQos {
                prefetch_size: 0,
                prefetch_count: 10,
                global: false,
            },
            Method::BasicConsume(BasicConsume {
                no_ack: true,
                ..BasicConsume::new("orders")
            }),
            Method::BasicPublish(BasicPublish {
                exchange: "events".into(),
                routing_key: "order.created".into(),
                mandatory: true,
                immediate: false,
            }),
            Method::BasicNack {
                delivery_tag: 9,
                multiple: true,
                requeue: false,
            },
        ];

        for method in methods {
            assert_eq!(reencode(&method), method, "{}", method.name());
        }
    }

    #[test]
    fn test_deliver_decode() {
        let deliver = Method::BasicDeliver(Deliver {
            consumer_tag: "ctag-1".into(),
            delivery_tag: u64::MAX,
            redelivered: true,
            exchange: "".into(),
            routing_key: "orders".into(),
        });
        assert_eq!(reencode(&deliver), deliver);
    }

    #[test]
    fn test_unknown_method() {
        let bytes = Bytes::from_static(&[0, 10, 0, 99]);
        assert_eq!(
            Method::decode(bytes),
            Err(WireError::UnknownMethod {
                class_id: 10,
                method_id: 99
            })
        );

        let bytes = Bytes::from_static(&[0, 90, 0, 10]);
        assert!(matches!(
            Method::decode(bytes),
            Err(WireError::UnknownMethod { class_id: 90, .. })
        ));
    }

    #[test]
    fn test_reply_answers_request() {
        let declare = Method::QueueDeclare(QueueDeclare::new("orders")).id();
        let declare_ok = Method::QueueDeclareOk(QueueDeclareOk {
            queue: "orders".into(),
            message_count: 0,
            consumer_count: 0,
        })
        .id();
        assert!(declare_ok.answers(declare));
        assert!(!Method::BasicQosOk.id().answers(declare));
        assert!(!Method::QueueBindOk.id().answers(declare));
        assert!(Method::ChannelCloseOk
            .id()
            .answers(Method::ChannelClose(Close::default()).id()));
    }

    #[test]
    fn test_truncated_method() {
        // queue.declare-ok with the counters missing
        let bytes = Bytes::from_static(&[0, 50, 0, 11, 1, b'q']);
        assert_eq!(Method::decode(bytes), Err(WireError::Incomplete));
    }

    #[test]
    fn test_start_ok_debug_redacts_response() {
        let start_ok = ConnectionStartOk {
            client_properties: FieldTable::new(),
            mechanism: "PLAIN".into(),
            response: Bytes::from_static(b"\0guest\0hunter2"),
            locale: String::new(),
        };
        let rendered = format!("{:?}", start_ok);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
