//! Async facade over the engine.
//!
//! [`Client`] owns the socket tasks: a reader that feeds the engine, the
//! writer behind [`ChannelTransport`], and a heartbeat ticker when one was
//! negotiated. The engine sits behind a mutex that is never held across an
//! await on a reply.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::delivery::Message;
use crate::error::AmqpError;
use crate::handshake::ConnectionState;
use crate::keepalive::heartbeat_interval;
use crate::transport::{connect_tcp, spawn_writer, ChannelTransport};
use amqp_wire::{
    BasicConsume, BasicProperties, BasicPublish, ExchangeDeclare, QueueBind, QueueDeclare,
    QueueDeclareOk, Tune,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::ToSocketAddrs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Engine = Arc<Mutex<Connection<ChannelTransport>>>;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A connected AMQP client
pub struct Client {
    engine: Engine,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
    tuning: Tune,
}

impl Client {
    /// Connect over TCP and complete the handshake
    pub async fn connect(
        addr: impl ToSocketAddrs,
        config: ConnectionConfig,
    ) -> Result<Self, AmqpError> {
        let (stream, peer) = connect_tcp(addr).await?;
        info!("Connected to {}", peer);
        Self::with_stream(stream, config).await
    }

    /// Complete the handshake over an already-connected byte stream
    pub async fn with_stream<S>(stream: S, config: ConnectionConfig) -> Result<Self, AmqpError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (transport, rx) = ChannelTransport::new();
        let writer = spawn_writer(write_half, rx);

        let mut connection = Connection::new(transport, config);
        let connected = connection.start()?;
        let engine = Arc::new(Mutex::new(connection));
        let reader = tokio::spawn(read_loop(read_half, engine.clone()));

        let tuning = match connected.await {
            Ok(tuning) => tuning,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };

        let heartbeat = heartbeat_interval(tuning.heartbeat)
            .map(|period| tokio::spawn(heartbeat_loop(engine.clone(), period)));

        Ok(Self {
            engine,
            reader,
            writer,
            heartbeat,
            tuning,
        })
    }

    /// Negotiated connection parameters
    pub fn tuning(&self) -> Tune {
        self.tuning
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.engine.lock().await.state()
    }

    /// Open a channel on `id`, or on the lowest free id
    pub async fn channel(&self, id: Option<u16>) -> Result<Channel, AmqpError> {
        let reply = self.engine.lock().await.open_channel(id)?;
        let id = reply.await?;
        Ok(Channel {
            id,
            engine: self.engine.clone(),
        })
    }

    /// Close the connection and wait for the socket tasks to finish
    pub async fn close(mut self, code: u16, reason: &str) -> Result<(), AmqpError> {
        let reply = self.engine.lock().await.close(code, reason)?;
        let result = reply.await;

        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Err(e) = (&mut self.writer).await {
            debug!("Writer task ended abnormally: {}", e);
        }
        if let Err(e) = (&mut self.reader).await {
            debug!("Reader task ended abnormally: {}", e);
        }
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

async fn read_loop<R>(mut reader: R, engine: Engine)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                engine.lock().await.on_transport_closed("connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                engine.lock().await.on_transport_closed(&e.to_string());
                break;
            }
        };

        let mut connection = engine.lock().await;
        if let Err(e) = connection.on_data(&buf[..n]) {
            error!("Failed to answer the broker: {}", e);
            connection.on_transport_closed(&e.to_string());
            break;
        }
        if connection.state() == ConnectionState::Closed {
            break;
        }
    }
    debug!("Reader task stopped");
}

async fn heartbeat_loop(engine: Engine, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut connection = engine.lock().await;
        if connection.state() == ConnectionState::Closed {
            break;
        }
        if let Err(e) = connection.send_heartbeat() {
            warn!("Failed to send heartbeat: {}", e);
            break;
        }
    }
}

/// An open channel
#[derive(Clone)]
pub struct Channel {
    id: u16,
    engine: Engine,
}

impl Channel {
    /// Channel id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Declare an exchange
    pub async fn exchange_declare(&self, args: ExchangeDeclare) -> Result<(), AmqpError> {
        let reply = self.engine.lock().await.exchange_declare(self.id, args)?;
        reply.await
    }

    /// Delete an exchange
    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<(), AmqpError> {
        let reply = self
            .engine
            .lock()
            .await
            .exchange_delete(self.id, exchange, if_unused)?;
        reply.await
    }

    /// Declare a queue
    pub async fn queue_declare(&self, args: QueueDeclare) -> Result<QueueDeclareOk, AmqpError> {
        let reply = self.engine.lock().await.queue_declare(self.id, args)?;
        reply.await
    }

    /// Bind a queue to an exchange
    pub async fn queue_bind(&self, args: QueueBind) -> Result<(), AmqpError> {
        let reply = self.engine.lock().await.queue_bind(self.id, args)?;
        reply.await
    }

    /// Remove a binding
    pub async fn queue_unbind(&self, args: QueueBind) -> Result<(), AmqpError> {
        let reply = self.engine.lock().await.queue_unbind(self.id, args)?;
        reply.await
    }

    /// Purge a queue, returning the number of messages removed
    pub async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let reply = self.engine.lock().await.queue_purge(self.id, queue)?;
        reply.await
    }

    /// Delete a queue, returning the number of messages it held
    pub async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        let reply = self
            .engine
            .lock()
            .await
            .queue_delete(self.id, queue, if_unused, if_empty)?;
        reply.await
    }

    /// Set the prefetch window
    pub async fn basic_qos(
        &self,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError> {
        let reply = self
            .engine
            .lock()
            .await
            .basic_qos(self.id, prefetch_size, prefetch_count, global)?;
        reply.await
    }

    /// Start a consumer
    pub async fn basic_consume(&self, args: BasicConsume) -> Result<Consumer, AmqpError> {
        let (reply, messages) = self.engine.lock().await.basic_consume(self.id, args)?;
        let tag = reply.await?;
        Ok(Consumer {
            channel: self.id,
            tag,
            messages,
        })
    }

    /// Cancel a consumer
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<String, AmqpError> {
        let reply = self
            .engine
            .lock()
            .await
            .basic_cancel(self.id, consumer_tag)?;
        reply.await
    }

    /// Enable publisher confirms
    pub async fn confirm_select(&self) -> Result<(), AmqpError> {
        let reply = self.engine.lock().await.confirm_select(self.id)?;
        reply.await
    }

    /// Publish a message; returns its sequence number in confirm mode
    pub async fn basic_publish(
        &self,
        args: BasicPublish,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<Option<u64>, AmqpError> {
        self.engine
            .lock()
            .await
            .basic_publish(self.id, args, properties, body)
    }

    /// Publishes the broker has not confirmed yet
    pub async fn unconfirmed_count(&self) -> Option<usize> {
        self.engine.lock().await.unconfirmed_count(self.id)
    }

    /// Acknowledge a delivery
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.engine
            .lock()
            .await
            .basic_ack(self.id, delivery_tag, multiple)
    }

    /// Negatively acknowledge deliveries
    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.engine
            .lock()
            .await
            .basic_nack(self.id, delivery_tag, multiple, requeue)
    }

    /// Reject one delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.engine
            .lock()
            .await
            .basic_reject(self.id, delivery_tag, requeue)
    }

    /// Close the channel
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError> {
        let reply = self
            .engine
            .lock()
            .await
            .close_channel(self.id, code, reason)?;
        reply.await
    }
}

/// Message stream for one consumer tag
#[derive(Debug)]
pub struct Consumer {
    channel: u16,
    tag: String,
    messages: mpsc::UnboundedReceiver<Message>,
}

impl Consumer {
    /// Tag the broker assigned or confirmed
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Channel the consumer runs on
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Next message; `None` once the consumer is cancelled or the channel
    /// closes
    pub async fn next(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}
