//! AMQP 0-9-1 client connection engine.
//!
//! This crate drives one broker connection: the opening handshake, channel
//! multiplexing, request/response correlation, delivery reassembly,
//! publisher confirms and orderly shutdown.
//!
//! ## Layers
//!
//! - **Engine** ([`Connection`]): sans-IO state machine. Feed it bytes with
//!   `on_data`, it writes frames through a [`Transport`] and completes
//!   [`Reply`] futures.
//! - **Transport**: [`ChannelTransport`] queues frames for a tokio writer
//!   task; tests use an in-memory recorder.
//! - **Client** ([`Client`], [`Channel`], [`Consumer`]): async facade that
//!   owns the socket tasks and heartbeats.
//!
//! ## Example
//!
//! ```rust,no_run
//! use amqp_session::{Client, ConnectionConfig};
//! use amqp_wire::{BasicConsume, BasicProperties, BasicPublish, QueueDeclare};
//!
//! # async fn example() -> Result<(), amqp_session::AmqpError> {
//! let client = Client::connect("127.0.0.1:5672", ConnectionConfig::default()).await?;
//! let channel = client.channel(None).await?;
//!
//! let queue = channel.queue_declare(QueueDeclare::new("orders")).await?;
//! println!("{} has {} messages", queue.queue, queue.message_count);
//!
//! let publish = BasicPublish {
//!     routing_key: "orders".into(),
//!     ..Default::default()
//! };
//! channel
//!     .basic_publish(publish, BasicProperties::default(), b"hello")
//!     .await?;
//!
//! let mut consumer = channel.basic_consume(BasicConsume::new("orders")).await?;
//! if let Some(message) = consumer.next().await {
//!     channel.basic_ack(message.delivery_tag, false).await?;
//! }
//!
//! client.close(200, "bye").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod reply;
pub mod transport;

// Re-export main types
pub use channel::ChannelStatus;
pub use client::{Channel, Client, Consumer};
pub use config::{ClientIdentity, ConnectionConfig, Secret};
pub use connection::{Connection, ConnectionStats, REPLY_SUCCESS};
pub use delivery::Message;
pub use error::{AmqpError, TransportError};
pub use handshake::{ConnectionState, MECHANISM_PLAIN};
pub use keepalive::{heartbeat_interval, negotiate_heartbeat};
pub use reply::{FromReply, MethodReply, Reply};
pub use transport::{connect_tcp, spawn_writer, ChannelTransport, Transport};
