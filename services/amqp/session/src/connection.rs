//! The connection engine.
//!
//! [`Connection`] is transport-agnostic and never blocks: bytes go in through
//! [`Connection::on_data`], frames go out through the [`Transport`], and
//! requests hand back [`Reply`] futures that dispatch completes. All parsing
//! and dispatch for one connection happens inside `on_data`, so frames are
//! processed strictly in arrival order.

use crate::channel::{ChannelContext, ChannelStatus, ConfirmTracker};
use crate::config::ConnectionConfig;
use crate::delivery::{Delivery, Message};
use crate::error::AmqpError;
use crate::handshake::{self, ConnectionState};
use crate::reply::{Continuation, MethodReply, Reply};
use crate::transport::Transport;
use amqp_wire::{
    BasicConsume, BasicProperties, BasicPublish, ClassId, Close, ContentHeader, ExchangeDeclare,
    Frame, FrameDecoder, FrameType, Method, MethodId, QueueBind, QueueDeclare, QueueDeclareOk,
    Tune, WireError, FRAME_OVERHEAD, PROTOCOL_HEADER,
};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Reply code for a normal close
pub const REPLY_SUCCESS: u16 = 200;

/// Counters for one connection
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    /// Bytes fed to `on_data`
    pub bytes_in: u64,
    /// Bytes handed to the transport
    pub bytes_out: u64,
    /// Frames dispatched
    pub frames_received: u64,
    /// Frames sent
    pub frames_sent: u64,
    /// Heartbeats received
    pub heartbeats_received: u64,
}

/// Client side of one broker connection
pub struct Connection<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    tuning: Tune,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    /// Handshake or client-close continuation
    pending: Option<Continuation>,
    /// Reason given for a client-initiated close
    local_close: Option<Close>,
    channels: BTreeMap<u16, ChannelContext>,
    stats: ConnectionStats,
}

impl<T: Transport> Connection<T> {
    /// Create an engine that writes to `transport`
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        let decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        Self {
            transport,
            config,
            state: ConnectionState::Start,
            tuning: Tune::default(),
            decoder,
            read_buf: BytesMut::with_capacity(64 * 1024),
            pending: None,
            local_close: None,
            channels: BTreeMap::new(),
            stats: ConnectionStats::default(),
        }
    }

    /// Current handshake state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Negotiated parameters; all zero before tuning
    pub fn tuning(&self) -> Tune {
        self.tuning
    }

    /// Connection counters
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ids of channels currently in the table, ascending
    pub fn channel_ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// Lifecycle state of a channel, `None` once closed
    pub fn channel_status(&self, channel: u16) -> Option<ChannelStatus> {
        self.channels.get(&channel).map(|ctx| ctx.status)
    }

    /// Publishes not yet confirmed on a confirm-mode channel
    pub fn unconfirmed_count(&self, channel: u16) -> Option<usize> {
        self.channels
            .get(&channel)?
            .confirms
            .as_ref()
            .map(|confirms| confirms.unconfirmed())
    }

    fn frame_max(&self) -> usize {
        self.tuning.frame_max as usize
    }

    fn channel_max(&self) -> u16 {
        match self.tuning.channel_max {
            0 => u16::MAX,
            max => max,
        }
    }

    fn send(&mut self, frame: Bytes) -> Result<(), AmqpError> {
        self.stats.frames_sent += 1;
        self.stats.bytes_out += frame.len() as u64;
        self.transport.send(frame)?;
        Ok(())
    }

    fn send_method(&mut self, channel: u16, method: Method) -> Result<(), AmqpError> {
        trace!("Sending {} on channel {}", method.name(), channel);
        let frame = method.encode(channel, self.frame_max())?;
        self.send(frame)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), AmqpError> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(AmqpError::InvalidState {
                state: self.state.as_str(),
                operation,
            })
        }
    }

    /// Look up a channel that is open for application traffic
    fn open_channel_ctx(
        &mut self,
        channel: u16,
        operation: &'static str,
    ) -> Result<&mut ChannelContext, AmqpError> {
        let ctx = self
            .channels
            .get_mut(&channel)
            .ok_or(AmqpError::ChannelNotFound(channel))?;
        if ctx.status != ChannelStatus::Open {
            return Err(AmqpError::InvalidState {
                state: ctx.status.as_str(),
                operation,
            });
        }
        Ok(ctx)
    }

    /// Send the protocol header and wait for the broker to drive the
    /// handshake. The reply resolves with the negotiated tuning.
    pub fn start(&mut self) -> Result<Reply<Tune>, AmqpError> {
        if self.state != ConnectionState::Start || self.pending.is_some() {
            return Err(AmqpError::InvalidState {
                state: self.state.as_str(),
                operation: "start",
            });
        }
        let (continuation, reply) = Continuation::new(Method::ConnectionOpen {
            vhost: String::new(),
        }
        .id());
        self.send(Bytes::from_static(PROTOCOL_HEADER))?;
        self.pending = Some(continuation);
        debug!("Sent protocol header");
        Ok(reply)
    }

    /// Feed bytes read from the transport.
    ///
    /// Frames may be split or batched arbitrarily across calls. Decode
    /// problems are logged and skipped; only transport failures while
    /// sending an automatic reply are returned.
    pub fn on_data(&mut self, data: &[u8]) -> Result<(), AmqpError> {
        if self.state == ConnectionState::Closed {
            debug!("Ignoring {} bytes on a closed connection", data.len());
            return Ok(());
        }
        self.stats.bytes_in += data.len() as u64;
        self.read_buf.extend_from_slice(data);

        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => self.dispatch(frame)?,
                Ok(None) => break,
                Err(WireError::Size(size)) => {
                    warn!(
                        "Lost framing: frame size {} exceeds limit, discarding {} buffered bytes",
                        size,
                        self.read_buf.len()
                    );
                    self.read_buf.clear();
                    break;
                }
                Err(e) => {
                    error!("Corrupt frame discarded: {}", e);
                }
            }
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        Ok(())
    }

    /// The transport is gone: fail everything and mark the connection closed
    pub fn on_transport_closed(&mut self, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        warn!("Transport closed: {}", reason);
        self.shutdown(&Close {
            reply_code: 0,
            reply_text: reason.to_string(),
            class_id: 0,
            method_id: 0,
        });
    }

    /// Send a heartbeat frame
    pub fn send_heartbeat(&mut self) -> Result<(), AmqpError> {
        trace!("Sending heartbeat");
        self.send(Frame::heartbeat())
    }

    fn dispatch(&mut self, frame: Frame) -> Result<(), AmqpError> {
        self.stats.frames_received += 1;
        match frame.typ {
            FrameType::Heartbeat => {
                self.stats.heartbeats_received += 1;
                trace!("Received heartbeat");
                self.send(Frame::heartbeat())
            }
            FrameType::Method => {
                let method = match Method::decode(frame.payload) {
                    Ok(method) => method,
                    Err(WireError::UnknownMethod {
                        class_id,
                        method_id,
                    }) => {
                        let err = AmqpError::UnsupportedMethod {
                            class_id,
                            method_id,
                        };
                        warn!("Skipping frame on channel {}: {}", frame.channel, err);
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            "Failed to decode method on channel {}: {}",
                            frame.channel,
                            AmqpError::Decode(e)
                        );
                        return Ok(());
                    }
                };
                trace!("Received {} on channel {}", method.name(), frame.channel);
                if frame.channel == 0 {
                    self.on_connection_method(method)
                } else {
                    self.on_channel_method(frame.channel, method)
                }
            }
            FrameType::Header => {
                self.on_content_header(frame.channel, frame.payload);
                Ok(())
            }
            FrameType::Body => {
                self.on_content_body(frame.channel, &frame.payload);
                Ok(())
            }
        }
    }

    fn on_connection_method(&mut self, method: Method) -> Result<(), AmqpError> {
        match method {
            Method::ConnectionStart(start) => {
                if self.state != ConnectionState::Start {
                    warn!("Unexpected connection.start while {}", self.state.as_str());
                    return Ok(());
                }
                debug!(
                    "Server speaks {}-{}, mechanisms '{}'",
                    start.version_major, start.version_minor, start.mechanisms
                );
                if !handshake::supports_plain(&start.mechanisms) {
                    warn!(
                        "Server does not offer {} (offers '{}')",
                        handshake::MECHANISM_PLAIN,
                        start.mechanisms
                    );
                }
                // the state stays Start until tune arrives
                let start_ok = handshake::start_ok(&self.config);
                self.send_method(0, Method::ConnectionStartOk(start_ok))
            }
            Method::ConnectionTune(server) => {
                if self.state != ConnectionState::Start {
                    warn!("Unexpected connection.tune while {}", self.state.as_str());
                    return Ok(());
                }
                self.tuning = handshake::negotiate(&server, &self.config);
                debug!(
                    "Tuned: channel_max={} frame_max={} heartbeat={} (server proposed {:?})",
                    self.tuning.channel_max, self.tuning.frame_max, self.tuning.heartbeat, server
                );
                self.send_method(0, Method::ConnectionTuneOk(self.tuning))?;
                let vhost = self.config.vhost.clone();
                self.send_method(0, Method::ConnectionOpen { vhost })?;
                self.state = ConnectionState::AwaitingOpenOk;
                Ok(())
            }
            Method::ConnectionOpenOk => {
                if self.state != ConnectionState::AwaitingOpenOk {
                    warn!(
                        "Unexpected connection.open-ok while {}",
                        self.state.as_str()
                    );
                    return Ok(());
                }
                self.state = ConnectionState::Open;
                info!("Connection open on vhost '{}'", self.config.vhost);
                if let Some(pending) = self.pending.take() {
                    pending.resolve(MethodReply::Connected(self.tuning));
                }
                Ok(())
            }
            Method::ConnectionClose(close) => {
                warn!(
                    "Server closed connection: {} {} (method {}/{})",
                    close.reply_code, close.reply_text, close.class_id, close.method_id
                );
                let sent = self.send_method(0, Method::ConnectionCloseOk);
                self.shutdown(&close);
                sent
            }
            Method::ConnectionCloseOk => {
                if self.state != ConnectionState::Closing {
                    warn!(
                        "Unexpected connection.close-ok while {}",
                        self.state.as_str()
                    );
                    return Ok(());
                }
                let close = self.local_close.take().unwrap_or_default();
                if let Some(pending) = self.pending.take() {
                    pending.resolve(MethodReply::Unit);
                }
                self.shutdown(&close);
                info!("Connection closed");
                Ok(())
            }
            other => {
                warn!("Unexpected {} on channel 0", other.name());
                Ok(())
            }
        }
    }

    /// Fail every continuation, drop every channel and close the transport
    fn shutdown(&mut self, close: &Close) {
        let closed = || AmqpError::ConnectionClosed {
            code: close.reply_code,
            text: close.reply_text.clone(),
            class_id: close.class_id,
            method_id: close.method_id,
        };
        if let Some(pending) = self.pending.take() {
            pending.fail(closed());
        }
        for (_, ctx) in std::mem::take(&mut self.channels) {
            ctx.fail(closed());
        }
        self.read_buf.clear();
        self.transport.close();
        self.state = ConnectionState::Closed;
    }

    /// Take the channel's continuation if `reply` answers it. A reply that
    /// matches nothing leaves the slot untouched.
    fn take_pending(
        &mut self,
        channel: u16,
        reply: MethodId,
        name: &'static str,
    ) -> Option<Continuation> {
        let slot = match self.channels.get_mut(&channel) {
            Some(ctx) => &mut ctx.pending,
            None => {
                warn!("Received {} for unknown channel {}", name, channel);
                return None;
            }
        };
        match slot.as_ref().map(|pending| pending.request) {
            Some(request) if reply.answers(request) => slot.take(),
            Some(request) => {
                warn!(
                    "Protocol anomaly: {} on channel {} does not answer pending {}, ignoring",
                    name, channel, request
                );
                None
            }
            None => {
                warn!(
                    "Received {} on channel {} with no request pending",
                    name, channel
                );
                None
            }
        }
    }

    /// Complete the channel's continuation with `reply`
    fn complete(&mut self, channel: u16, id: MethodId, name: &'static str, reply: MethodReply) {
        if let Some(pending) = self.take_pending(channel, id, name) {
            pending.resolve(reply);
        }
    }

    fn on_channel_method(&mut self, channel: u16, method: Method) -> Result<(), AmqpError> {
        let id = method.id();
        let name = method.name();
        match method {
            Method::ChannelOpenOk => {
                if let Some(pending) = self.take_pending(channel, id, name) {
                    if let Some(ctx) = self.channels.get_mut(&channel) {
                        ctx.status = ChannelStatus::Open;
                    }
                    debug!("Channel {} open", channel);
                    pending.resolve(MethodReply::ChannelOpened(channel));
                }
            }
            Method::ChannelClose(close) => {
                // acknowledge even when the channel is unknown to us
                let sent = self.send_method(channel, Method::ChannelCloseOk);
                match self.channels.remove(&channel) {
                    Some(ctx) => {
                        warn!(
                            "Server closed channel {}: {} {} (method {}/{})",
                            channel,
                            close.reply_code,
                            close.reply_text,
                            close.class_id,
                            close.method_id
                        );
                        ctx.fail(AmqpError::ChannelClosed {
                            channel,
                            code: close.reply_code,
                            text: close.reply_text,
                            class_id: close.class_id,
                            method_id: close.method_id,
                        });
                    }
                    None => warn!("channel.close for unknown channel {}", channel),
                }
                return sent;
            }
            Method::ChannelCloseOk => match self.channels.remove(&channel) {
                Some(mut ctx) => {
                    debug!("Channel {} closed", channel);
                    let closing = ctx
                        .pending
                        .as_ref()
                        .is_some_and(|pending| id.answers(pending.request));
                    if closing {
                        if let Some(pending) = ctx.pending.take() {
                            pending.resolve(MethodReply::Unit);
                        }
                    }
                    ctx.fail(AmqpError::ChannelNotFound(channel));
                }
                None => warn!("channel.close-ok for unknown channel {}", channel),
            },
            Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::BasicQosOk => self.complete(channel, id, name, MethodReply::Unit),
            Method::ConfirmSelectOk => {
                if let Some(pending) = self.take_pending(channel, id, name) {
                    if let Some(ctx) = self.channels.get_mut(&channel) {
                        if ctx.confirms.is_none() {
                            ctx.confirms = Some(ConfirmTracker::new());
                        }
                    }
                    pending.resolve(MethodReply::Unit);
                }
            }
            Method::QueueDeclareOk(ok) => {
                self.complete(channel, id, name, MethodReply::QueueDeclared(ok))
            }
            Method::QueuePurgeOk { message_count } | Method::QueueDeleteOk { message_count } => {
                self.complete(channel, id, name, MethodReply::MessageCount(message_count))
            }
            Method::BasicConsumeOk { consumer_tag } => {
                if let Some(mut pending) = self.take_pending(channel, id, name) {
                    if let Some(sink) = pending.consumer.take() {
                        if let Some(ctx) = self.channels.get_mut(&channel) {
                            ctx.consumers.insert(consumer_tag.clone(), sink);
                        }
                    }
                    debug!("Consumer '{}' started on channel {}", consumer_tag, channel);
                    pending.resolve(MethodReply::ConsumerTag(consumer_tag));
                }
            }
            Method::BasicCancelOk { consumer_tag } => {
                if let Some(pending) = self.take_pending(channel, id, name) {
                    if let Some(ctx) = self.channels.get_mut(&channel) {
                        ctx.consumers.remove(&consumer_tag);
                    }
                    pending.resolve(MethodReply::ConsumerTag(consumer_tag));
                }
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                info!(
                    "Server cancelled consumer '{}' on channel {}",
                    consumer_tag, channel
                );
                if let Some(ctx) = self.channels.get_mut(&channel) {
                    ctx.consumers.remove(&consumer_tag);
                }
                if !no_wait {
                    return self.send_method(channel, Method::BasicCancelOk { consumer_tag });
                }
            }
            Method::BasicDeliver(deliver) => match self.channels.get_mut(&channel) {
                Some(ctx) => {
                    if let Some(previous) = ctx.delivery.take() {
                        warn!(
                            "Delivery for '{}' on channel {} replaced before completion",
                            previous.consumer_tag(),
                            channel
                        );
                    }
                    ctx.delivery = Some(Delivery::new(channel, deliver));
                }
                None => warn!(
                    "Delivery {} for unknown channel {}, dropping",
                    deliver.delivery_tag, channel
                ),
            },
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => self.on_confirm(channel, delivery_tag, multiple, false),
            Method::BasicNack {
                delivery_tag,
                multiple,
                ..
            } => self.on_confirm(channel, delivery_tag, multiple, true),
            other => warn!("Unexpected {} on channel {}", other.name(), channel),
        }
        Ok(())
    }

    fn on_confirm(&mut self, channel: u16, tag: u64, multiple: bool, nack: bool) {
        let confirms = match self
            .channels
            .get_mut(&channel)
            .and_then(|ctx| ctx.confirms.as_mut())
        {
            Some(confirms) => confirms,
            None => {
                warn!(
                    "Publisher confirm for tag {} on channel {} not in confirm mode",
                    tag, channel
                );
                return;
            }
        };
        let settled = confirms.settle(tag, multiple);
        if nack {
            warn!(
                "Broker nacked {} publish(es) up to tag {} on channel {}",
                settled, tag, channel
            );
        } else {
            trace!(
                "Confirmed {} publish(es) up to tag {} on channel {}",
                settled, tag, channel
            );
        }
    }

    fn on_content_header(&mut self, channel: u16, payload: Bytes) {
        let ctx = match self.channels.get_mut(&channel) {
            Some(ctx) => ctx,
            None => {
                warn!("Content header for unknown channel {}, dropping", channel);
                return;
            }
        };
        let delivery = match ctx.delivery.as_mut() {
            Some(delivery) => delivery,
            None => {
                error!(
                    "Protocol decode error: content header on channel {} without a delivery",
                    channel
                );
                return;
            }
        };
        let result = ContentHeader::decode(payload).and_then(|header| delivery.on_header(header));
        if let Err(e) = result {
            error!(
                "Protocol decode error on channel {}: {}, dropping delivery",
                channel, e
            );
            ctx.delivery = None;
            return;
        }
        ctx.complete_delivery();
    }

    fn on_content_body(&mut self, channel: u16, chunk: &[u8]) {
        let ctx = match self.channels.get_mut(&channel) {
            Some(ctx) => ctx,
            None => {
                warn!("Content body for unknown channel {}, dropping", channel);
                return;
            }
        };
        let result = match ctx.delivery.as_mut() {
            Some(delivery) => delivery.on_body(chunk),
            None => Err(WireError::Malformed("content body without a delivery")),
        };
        if let Err(e) = result {
            error!(
                "Protocol decode error on channel {}: {}, dropping delivery",
                channel, e
            );
            ctx.delivery = None;
            return;
        }
        ctx.complete_delivery();
    }

    /// Send a request on an open channel after filling its continuation slot
    fn call<R: crate::reply::FromReply>(
        &mut self,
        channel: u16,
        method: Method,
        consumer: Option<mpsc::UnboundedSender<Message>>,
    ) -> Result<Reply<R>, AmqpError> {
        let operation = method.name();
        self.ensure_open(operation)?;
        let frame = method.encode(channel, self.frame_max())?;

        let ctx = self.open_channel_ctx(channel, operation)?;
        let (mut continuation, reply) = Continuation::new(method.id());
        if let Some(sink) = consumer {
            continuation = continuation.with_consumer(sink);
        }
        ctx.install(continuation)?;

        trace!("Sending {} on channel {}", operation, channel);
        if let Err(e) = self.send(frame) {
            if let Some(ctx) = self.channels.get_mut(&channel) {
                ctx.pending = None;
            }
            return Err(e);
        }
        Ok(reply)
    }

    fn allocate_channel_id(&self) -> Result<u16, AmqpError> {
        let max = self.channel_max();
        let mut candidate: u16 = 1;
        for &id in self.channels.keys() {
            if id > candidate {
                break;
            }
            if id == candidate {
                if candidate == max {
                    return Err(AmqpError::NoFreeChannel);
                }
                candidate += 1;
            }
        }
        if candidate > max {
            return Err(AmqpError::NoFreeChannel);
        }
        Ok(candidate)
    }

    /// Open a channel, on `id` or on the lowest free id
    pub fn open_channel(&mut self, id: Option<u16>) -> Result<Reply<u16>, AmqpError> {
        self.ensure_open("channel.open")?;
        let id = match id {
            Some(0) => return Err(AmqpError::InvalidChannel(0)),
            Some(id) if id > self.channel_max() => return Err(AmqpError::InvalidChannel(id)),
            Some(id) if self.channels.contains_key(&id) => {
                return Err(AmqpError::ChannelInUse(id))
            }
            Some(id) => id,
            None => self.allocate_channel_id()?,
        };

        let frame = Method::ChannelOpen.encode(id, self.frame_max())?;
        let (continuation, reply) = Continuation::new(Method::ChannelOpen.id());
        self.channels
            .insert(id, ChannelContext::opening(id, continuation));
        if let Err(e) = self.send(frame) {
            self.channels.remove(&id);
            return Err(e);
        }
        debug!("Opening channel {}", id);
        Ok(reply)
    }

    /// Close a channel; the reply resolves on close-ok
    pub fn close_channel(
        &mut self,
        channel: u16,
        code: u16,
        reason: &str,
    ) -> Result<Reply<()>, AmqpError> {
        let close = Method::ChannelClose(Close {
            reply_code: code,
            reply_text: reason.to_string(),
            class_id: 0,
            method_id: 0,
        });
        let reply = self.call(channel, close, None)?;
        if let Some(ctx) = self.channels.get_mut(&channel) {
            ctx.status = ChannelStatus::Closing;
        }
        Ok(reply)
    }

    /// exchange.declare
    pub fn exchange_declare(
        &mut self,
        channel: u16,
        args: ExchangeDeclare,
    ) -> Result<Reply<()>, AmqpError> {
        self.call(channel, Method::ExchangeDeclare(args), None)
    }

    /// exchange.delete
    pub fn exchange_delete(
        &mut self,
        channel: u16,
        exchange: &str,
        if_unused: bool,
    ) -> Result<Reply<()>, AmqpError> {
        let method = Method::ExchangeDelete {
            exchange: exchange.to_string(),
            if_unused,
        };
        self.call(channel, method, None)
    }

    /// queue.declare
    pub fn queue_declare(
        &mut self,
        channel: u16,
        args: QueueDeclare,
    ) -> Result<Reply<QueueDeclareOk>, AmqpError> {
        self.call(channel, Method::QueueDeclare(args), None)
    }

    /// queue.bind
    pub fn queue_bind(&mut self, channel: u16, args: QueueBind) -> Result<Reply<()>, AmqpError> {
        self.call(channel, Method::QueueBind(args), None)
    }

    /// queue.unbind
    pub fn queue_unbind(&mut self, channel: u16, args: QueueBind) -> Result<Reply<()>, AmqpError> {
        self.call(channel, Method::QueueUnbind(args), None)
    }

    /// queue.purge; resolves with the number of purged messages
    pub fn queue_purge(&mut self, channel: u16, queue: &str) -> Result<Reply<u32>, AmqpError> {
        let method = Method::QueuePurge {
            queue: queue.to_string(),
        };
        self.call(channel, method, None)
    }

    /// queue.delete; resolves with the number of deleted messages
    pub fn queue_delete(
        &mut self,
        channel: u16,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<Reply<u32>, AmqpError> {
        let method = Method::QueueDelete {
            queue: queue.to_string(),
            if_unused,
            if_empty,
        };
        self.call(channel, method, None)
    }

    /// basic.qos
    pub fn basic_qos(
        &mut self,
        channel: u16,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<Reply<()>, AmqpError> {
        let method = Method::BasicQos {
            prefetch_size,
            prefetch_count,
            global,
        };
        self.call(channel, method, None)
    }

    /// basic.consume; messages for the returned tag arrive on the receiver
    pub fn basic_consume(
        &mut self,
        channel: u16,
        args: BasicConsume,
    ) -> Result<(Reply<String>, mpsc::UnboundedReceiver<Message>), AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let reply = self.call(channel, Method::BasicConsume(args), Some(tx))?;
        Ok((reply, rx))
    }

    /// basic.cancel; the consumer's receiver ends on cancel-ok
    pub fn basic_cancel(
        &mut self,
        channel: u16,
        consumer_tag: &str,
    ) -> Result<Reply<String>, AmqpError> {
        let method = Method::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
            no_wait: false,
        };
        self.call(channel, method, None)
    }

    /// confirm.select: put the channel in publisher-confirm mode
    pub fn confirm_select(&mut self, channel: u16) -> Result<Reply<()>, AmqpError> {
        self.call(channel, Method::ConfirmSelect, None)
    }

    /// basic.publish with its header and body frames.
    ///
    /// The body is split so no frame exceeds the negotiated frame size.
    /// Returns the publish sequence number on a confirm-mode channel.
    pub fn basic_publish(
        &mut self,
        channel: u16,
        args: BasicPublish,
        properties: BasicProperties,
        body: &[u8],
    ) -> Result<Option<u64>, AmqpError> {
        self.ensure_open("basic.publish")?;
        let frame_max = self.frame_max();
        self.open_channel_ctx(channel, "basic.publish")?;

        let header = ContentHeader {
            class_id: ClassId::Basic as u16,
            body_size: body.len() as u64,
            properties,
        };
        let chunk_size = match frame_max {
            0 => body.len().max(1),
            max => max.saturating_sub(FRAME_OVERHEAD).max(1),
        };
        let mut frames = Vec::with_capacity(2 + body.len() / chunk_size + 1);
        frames.push(Method::BasicPublish(args).encode(channel, frame_max)?);
        frames.push(header.encode(channel, frame_max)?);
        for chunk in body.chunks(chunk_size) {
            frames.push(Frame::body(channel, chunk, frame_max)?);
        }

        let seq = self
            .channels
            .get_mut(&channel)
            .and_then(|ctx| ctx.confirms.as_mut())
            .map(|confirms| confirms.next_publish());
        for frame in frames {
            self.send(frame)?;
        }
        trace!("Published {} bytes on channel {}", body.len(), channel);
        Ok(seq)
    }

    /// basic.ack
    pub fn basic_ack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), AmqpError> {
        self.fire(channel, Method::BasicAck {
            delivery_tag,
            multiple,
        })
    }

    /// basic.nack
    pub fn basic_nack(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.fire(channel, Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        })
    }

    /// basic.reject
    pub fn basic_reject(
        &mut self,
        channel: u16,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.fire(channel, Method::BasicReject {
            delivery_tag,
            requeue,
        })
    }

    /// Send a method that has no reply
    fn fire(&mut self, channel: u16, method: Method) -> Result<(), AmqpError> {
        self.ensure_open(method.name())?;
        self.open_channel_ctx(channel, method.name())?;
        self.send_method(channel, method)
    }

    /// Close the connection; the reply resolves on close-ok
    pub fn close(&mut self, code: u16, reason: &str) -> Result<Reply<()>, AmqpError> {
        self.ensure_open("connection.close")?;
        let close = Close {
            reply_code: code,
            reply_text: reason.to_string(),
            class_id: 0,
            method_id: 0,
        };
        let method = Method::ConnectionClose(close.clone());
        let (continuation, reply) = Continuation::new(method.id());
        self.send_method(0, method)?;
        self.pending = Some(continuation);
        self.local_close = Some(close);
        self.state = ConnectionState::Closing;
        info!("Closing connection: {} {}", code, reason);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use amqp_wire::{ConnectionStart, Deliver, FieldTable, FieldValue};

    /// Encode a server method the way a broker would
    fn server(channel: u16, method: Method) -> Bytes {
        method.encode(channel, 0).unwrap()
    }

    fn server_header(channel: u16, body_size: u64) -> Bytes {
        ContentHeader {
            class_id: 60,
            body_size,
            properties: BasicProperties {
                content_type: Some("text/plain".into()),
                ..Default::default()
            },
        }
        .encode(channel, 0)
        .unwrap()
    }

    /// Decode every frame the engine sent, skipping the protocol header
    fn sent_frames(conn: &Connection<MockTransport>) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        conn.transport()
            .sent
            .iter()
            .filter(|bytes| bytes.as_ref() != PROTOCOL_HEADER)
            .map(|bytes| {
                let mut buf = BytesMut::from(bytes.as_ref());
                decoder.decode(&mut buf).unwrap().unwrap()
            })
            .collect()
    }

    fn sent_methods(conn: &Connection<MockTransport>) -> Vec<(u16, Method)> {
        sent_frames(conn)
            .into_iter()
            .filter(|frame| frame.typ == FrameType::Method)
            .map(|frame| (frame.channel, Method::decode(frame.payload).unwrap()))
            .collect()
    }

    fn clear_sent(conn: &mut Connection<MockTransport>) {
        conn.transport_mut().sent.clear();
    }

    fn connection_start() -> Method {
        Method::ConnectionStart(ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: FieldTable::new(),
            mechanisms: "AMQPLAIN PLAIN".into(),
            locales: "en_US".into(),
        })
    }

    fn server_tune() -> Method {
        Method::ConnectionTune(Tune {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        })
    }

    /// Run the full handshake against the mock
    fn open_connection() -> Connection<MockTransport> {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let mut connected = conn.start().unwrap();
        conn.on_data(&server(0, connection_start())).unwrap();
        conn.on_data(&server(0, server_tune())).unwrap();
        conn.on_data(&server(0, Method::ConnectionOpenOk)).unwrap();
        connected.try_take().unwrap().unwrap();
        clear_sent(&mut conn);
        conn
    }

    fn open_channel(conn: &mut Connection<MockTransport>) -> u16 {
        let mut reply = conn.open_channel(None).unwrap();
        let id = conn.channel_ids().into_iter().max().unwrap();
        conn.on_data(&server(id, Method::ChannelOpenOk)).unwrap();
        assert_eq!(reply.try_take().unwrap().unwrap(), id);
        id
    }

    fn consume(
        conn: &mut Connection<MockTransport>,
        channel: u16,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (mut reply, rx) = conn.basic_consume(channel, BasicConsume::new("orders")).unwrap();
        conn.on_data(&server(
            channel,
            Method::BasicConsumeOk {
                consumer_tag: "ctag-1".into(),
            },
        ))
        .unwrap();
        assert_eq!(reply.try_take().unwrap().unwrap(), "ctag-1");
        rx
    }

    fn deliver(channel: u16, delivery_tag: u64) -> Bytes {
        server(
            channel,
            Method::BasicDeliver(Deliver {
                consumer_tag: "ctag-1".into(),
                delivery_tag,
                redelivered: false,
                exchange: "".into(),
                routing_key: "orders".into(),
            }),
        )
    }

    #[test]
    fn test_handshake() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let mut connected = conn.start().unwrap();
        assert_eq!(conn.transport().sent[0].as_ref(), PROTOCOL_HEADER);
        assert_eq!(conn.state(), ConnectionState::Start);

        conn.on_data(&server(0, connection_start())).unwrap();
        assert_eq!(conn.state(), ConnectionState::Start);
        let methods = sent_methods(&conn);
        match &methods[0] {
            (0, Method::ConnectionStartOk(start_ok)) => {
                assert_eq!(start_ok.mechanism, "PLAIN");
                assert_eq!(&start_ok.response[..], b"\0guest\0guest");
                assert_eq!(start_ok.locale, "");
                let caps = match &start_ok.client_properties["capabilities"] {
                    FieldValue::Table(caps) => caps,
                    other => panic!("capabilities is {:?}", other),
                };
                assert_eq!(caps["publisher_confirms"], FieldValue::Bool(true));
            }
            other => panic!("expected start-ok, got {:?}", other),
        }

        conn.on_data(&server(0, server_tune())).unwrap();
        assert_eq!(conn.state(), ConnectionState::AwaitingOpenOk);
        let methods = sent_methods(&conn);
        assert_eq!(
            methods[1],
            (
                0,
                Method::ConnectionTuneOk(Tune {
                    channel_max: 2047,
                    frame_max: 4096,
                    heartbeat: 0,
                })
            )
        );
        assert_eq!(
            methods[2],
            (
                0,
                Method::ConnectionOpen {
                    vhost: "/".into()
                }
            )
        );
        assert!(connected.try_take().is_none());

        conn.on_data(&server(0, Method::ConnectionOpenOk)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        let tuning = connected.try_take().unwrap().unwrap();
        assert_eq!(tuning.frame_max, 4096);
        assert_eq!(tuning.heartbeat, 0);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let _connected = conn.start().unwrap();
        assert!(matches!(
            conn.start(),
            Err(AmqpError::InvalidState { operation: "start", .. })
        ));
    }

    #[test]
    fn test_operations_before_open_are_rejected() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        assert!(matches!(
            conn.open_channel(None),
            Err(AmqpError::InvalidState { state: "starting", .. })
        ));
    }

    #[test]
    fn test_handshake_refused() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let mut connected = conn.start().unwrap();
        conn.on_data(&server(0, connection_start())).unwrap();
        conn.on_data(&server(
            0,
            Method::ConnectionClose(Close {
                reply_code: 403,
                reply_text: "ACCESS_REFUSED".into(),
                class_id: 10,
                method_id: 11,
            }),
        ))
        .unwrap();

        match connected.try_take() {
            Some(Err(AmqpError::ConnectionClosed { code, text, .. })) => {
                assert_eq!(code, 403);
                assert_eq!(text, "ACCESS_REFUSED");
            }
            other => panic!("expected connection closed, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.transport().closed);
    }

    #[test]
    fn test_lowest_free_channel_id() {
        let mut conn = open_connection();
        assert_eq!(open_channel(&mut conn), 1);
        assert_eq!(open_channel(&mut conn), 2);
        assert_eq!(open_channel(&mut conn), 3);

        // broker closes channel 2, its id becomes free again
        conn.on_data(&server(
            2,
            Method::ChannelClose(Close {
                reply_code: 406,
                reply_text: "PRECONDITION_FAILED".into(),
                class_id: 0,
                method_id: 0,
            }),
        ))
        .unwrap();
        assert_eq!(conn.channel_ids(), vec![1, 3]);

        let _reply = conn.open_channel(None).unwrap();
        assert_eq!(conn.channel_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_explicit_channel_ids() {
        let mut conn = open_connection();
        let _reply = conn.open_channel(Some(7)).unwrap();
        assert!(matches!(
            conn.open_channel(Some(7)),
            Err(AmqpError::ChannelInUse(7))
        ));
        assert!(matches!(
            conn.open_channel(Some(0)),
            Err(AmqpError::InvalidChannel(0))
        ));
        assert!(matches!(
            conn.open_channel(Some(4000)),
            Err(AmqpError::InvalidChannel(4000))
        ));
        let _reply = conn.open_channel(None).unwrap();
        assert_eq!(conn.channel_ids(), vec![1, 7]);
    }

    #[test]
    fn test_queue_declare_ok() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        clear_sent(&mut conn);

        let mut reply = conn.queue_declare(channel, QueueDeclare::new("orders")).unwrap();
        let methods = sent_methods(&conn);
        assert!(matches!(
            &methods[0],
            (1, Method::QueueDeclare(args)) if args.queue == "orders"
        ));

        conn.on_data(&server(
            channel,
            Method::QueueDeclareOk(QueueDeclareOk {
                queue: "orders".into(),
                message_count: 0,
                consumer_count: 0,
            }),
        ))
        .unwrap();
        let ok = reply.try_take().unwrap().unwrap();
        assert_eq!(ok.queue, "orders");
        assert_eq!(ok.message_count, 0);
        assert_eq!(ok.consumer_count, 0);
    }

    #[test]
    fn test_second_request_is_busy() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        clear_sent(&mut conn);

        let _first = conn.queue_declare(channel, QueueDeclare::new("a")).unwrap();
        assert!(matches!(
            conn.queue_declare(channel, QueueDeclare::new("b")),
            Err(AmqpError::ChannelBusy(1))
        ));
        assert_eq!(sent_methods(&conn).len(), 1);
    }

    #[test]
    fn test_stray_reply_leaves_request_pending() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);

        let mut reply = conn.queue_declare(channel, QueueDeclare::new("orders")).unwrap();
        conn.on_data(&server(channel, Method::BasicQosOk)).unwrap();
        conn.on_data(&server(
            channel,
            Method::BasicConsumeOk {
                consumer_tag: "ctag-stray".into(),
            },
        ))
        .unwrap();
        assert!(reply.try_take().is_none());

        conn.on_data(&server(
            channel,
            Method::QueueDeclareOk(QueueDeclareOk {
                queue: "orders".into(),
                message_count: 3,
                consumer_count: 1,
            }),
        ))
        .unwrap();
        let ok = reply.try_take().unwrap().unwrap();
        assert_eq!(ok.message_count, 3);
    }

    #[test]
    fn test_reply_without_request_is_ignored() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        conn.on_data(&server(channel, Method::ExchangeDeclareOk)).unwrap();

        let mut reply = conn.basic_qos(channel, 0, 10, false).unwrap();
        conn.on_data(&server(channel, Method::BasicQosOk)).unwrap();
        reply.try_take().unwrap().unwrap();
    }

    #[test]
    fn test_unknown_channel() {
        let mut conn = open_connection();
        assert!(matches!(
            conn.queue_purge(9, "orders"),
            Err(AmqpError::ChannelNotFound(9))
        ));
    }

    #[test]
    fn test_server_channel_close() {
        let mut conn = open_connection();
        for _ in 0..3 {
            open_channel(&mut conn);
        }
        clear_sent(&mut conn);

        let mut reply = conn.queue_declare(3, QueueDeclare::new("missing")).unwrap();
        conn.on_data(&server(
            3,
            Method::ChannelClose(Close {
                reply_code: 404,
                reply_text: "NOT_FOUND".into(),
                class_id: 50,
                method_id: 10,
            }),
        ))
        .unwrap();

        match reply.try_take() {
            Some(Err(AmqpError::ChannelClosed {
                channel,
                code,
                text,
                class_id,
                method_id,
            })) => {
                assert_eq!((channel, code), (3, 404));
                assert_eq!(text, "NOT_FOUND");
                assert_eq!((class_id, method_id), (50, 10));
            }
            other => panic!("expected channel closed, got {:?}", other),
        }

        let methods = sent_methods(&conn);
        assert_eq!(methods.last(), Some(&(3, Method::ChannelCloseOk)));
        assert_eq!(conn.channel_ids(), vec![1, 2]);
    }

    #[test]
    fn test_close_for_unknown_channel_is_acknowledged() {
        let mut conn = open_connection();
        conn.on_data(&server(5, Method::ChannelClose(Close::default()))).unwrap();
        assert_eq!(sent_methods(&conn), vec![(5, Method::ChannelCloseOk)]);
    }

    #[test]
    fn test_client_channel_close() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);

        let mut reply = conn.close_channel(channel, REPLY_SUCCESS, "bye").unwrap();
        assert_eq!(conn.channel_status(channel), Some(ChannelStatus::Closing));
        assert!(matches!(
            conn.basic_ack(channel, 1, false),
            Err(AmqpError::InvalidState { state: "closing", .. })
        ));

        conn.on_data(&server(channel, Method::ChannelCloseOk)).unwrap();
        reply.try_take().unwrap().unwrap();
        assert_eq!(conn.channel_status(channel), None);
    }

    #[test]
    fn test_zero_length_delivery() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut messages = consume(&mut conn, channel);

        conn.on_data(&deliver(channel, 1)).unwrap();
        assert!(messages.try_recv().is_err());
        conn.on_data(&server_header(channel, 0)).unwrap();

        let message = messages.try_recv().unwrap();
        assert_eq!(message.delivery_tag, 1);
        assert!(message.body.is_empty());
        assert_eq!(
            message.properties.content_type.as_deref(),
            Some("text/plain")
        );
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn test_multi_frame_delivery() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut messages = consume(&mut conn, channel);

        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&deliver(channel, 42));
        stream.extend_from_slice(&server_header(channel, body.len() as u64));
        for chunk in body.chunks(4088) {
            stream.extend_from_slice(&Frame::body(channel, chunk, 4096).unwrap());
        }
        conn.on_data(&stream).unwrap();

        let message = messages.try_recv().unwrap();
        assert_eq!(message.delivery_tag, 42);
        assert_eq!(message.consumer_tag, "ctag-1");
        assert_eq!(&message.body[..], &body[..]);
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn test_body_overflow_drops_delivery() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut messages = consume(&mut conn, channel);

        conn.on_data(&deliver(channel, 1)).unwrap();
        conn.on_data(&server_header(channel, 3)).unwrap();
        conn.on_data(&Frame::body(channel, b"toolong", 0).unwrap()).unwrap();
        assert!(messages.try_recv().is_err());

        // the channel keeps working for the next delivery
        conn.on_data(&deliver(channel, 2)).unwrap();
        conn.on_data(&server_header(channel, 2)).unwrap();
        conn.on_data(&Frame::body(channel, b"ok", 0).unwrap()).unwrap();
        assert_eq!(messages.try_recv().unwrap().delivery_tag, 2);
    }

    #[test]
    fn test_delivery_for_removed_channel_is_dropped() {
        let mut conn = open_connection();
        conn.on_data(&deliver(4, 1)).unwrap();
        conn.on_data(&server_header(4, 0)).unwrap();
        assert!(conn.channel_ids().is_empty());
    }

    #[test]
    fn test_heartbeat_reply() {
        let mut conn = open_connection();
        conn.on_data(&Frame::heartbeat()).unwrap();

        let sent = &conn.transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], Frame::heartbeat());
        assert_eq!(&sent[0][..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
        assert_eq!(conn.stats().heartbeats_received, 1);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut conn = open_connection();
        let _reply = conn.open_channel(None).unwrap();

        let open_ok = server(1, Method::ChannelOpenOk);
        for byte in open_ok.iter() {
            assert_eq!(conn.channel_status(1), Some(ChannelStatus::Opening));
            conn.on_data(&[*byte]).unwrap();
        }
        assert_eq!(conn.channel_status(1), Some(ChannelStatus::Open));
    }

    #[test]
    fn test_bad_frame_end_is_skipped() {
        let mut conn = open_connection();
        let _reply = conn.open_channel(None).unwrap();
        clear_sent(&mut conn);

        let mut corrupt = BytesMut::from(Frame::heartbeat().as_ref());
        corrupt[7] = 0x00;
        corrupt.extend_from_slice(&server(1, Method::ChannelOpenOk));
        conn.on_data(&corrupt).unwrap();

        // the corrupt heartbeat got no reply, the next frame still dispatched
        assert!(conn.transport().sent.is_empty());
        assert_eq!(conn.channel_status(1), Some(ChannelStatus::Open));
    }

    #[test]
    fn test_oversized_frame_discards_buffer() {
        let mut conn = Connection::new(
            MockTransport::default(),
            ConnectionConfig {
                max_frame_size: 4096,
                ..Default::default()
            },
        );
        let _connected = conn.start().unwrap();
        conn.on_data(&[1, 0, 0, 0, 1, 0, 0, 9, 9, 9]).unwrap();
        assert_eq!(conn.state(), ConnectionState::Start);

        // after the discard, a well-formed frame is understood again
        conn.on_data(&server(0, connection_start())).unwrap();
        assert!(matches!(
            sent_methods(&conn).as_slice(),
            [(0, Method::ConnectionStartOk(_))]
        ));
    }

    #[test]
    fn test_every_start_is_answered() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let _connected = conn.start().unwrap();
        conn.on_data(&server(0, connection_start())).unwrap();
        conn.on_data(&server(0, connection_start())).unwrap();
        assert_eq!(conn.state(), ConnectionState::Start);

        let start_oks = sent_methods(&conn)
            .into_iter()
            .filter(|(_, method)| matches!(method, Method::ConnectionStartOk(_)))
            .count();
        assert_eq!(start_oks, 2);

        conn.on_data(&server(0, server_tune())).unwrap();
        assert_eq!(conn.state(), ConnectionState::AwaitingOpenOk);
    }

    #[test]
    fn test_tune_ignored_once_tuned() {
        let mut conn = Connection::new(MockTransport::default(), ConnectionConfig::default());
        let _connected = conn.start().unwrap();
        conn.on_data(&server(0, connection_start())).unwrap();
        conn.on_data(&server(0, server_tune())).unwrap();
        clear_sent(&mut conn);

        conn.on_data(&server(0, server_tune())).unwrap();
        assert_eq!(conn.state(), ConnectionState::AwaitingOpenOk);
        assert!(sent_methods(&conn).is_empty());
    }

    #[test]
    fn test_unsupported_method_is_skipped() {
        let mut conn = open_connection();
        let _reply = conn.open_channel(None).unwrap();

        let mut unknown = amqp_wire::FrameWriter::method(1, 90, 10);
        bytes::BufMut::put_u8(unknown.buf_mut(), 0);
        let mut stream = BytesMut::from(unknown.finish(0).unwrap().as_ref());
        stream.extend_from_slice(&server(1, Method::ChannelOpenOk));
        conn.on_data(&stream).unwrap();

        assert_eq!(conn.channel_status(1), Some(ChannelStatus::Open));
    }

    #[test]
    fn test_publish_splits_body() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        clear_sent(&mut conn);

        let body = vec![7u8; 10_000];
        let seq = conn
            .basic_publish(
                channel,
                BasicPublish {
                    routing_key: "orders".into(),
                    ..Default::default()
                },
                BasicProperties::default(),
                &body,
            )
            .unwrap();
        assert_eq!(seq, None);

        let frames = sent_frames(&conn);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].typ, FrameType::Method);
        assert_eq!(frames[1].typ, FrameType::Header);
        let header = ContentHeader::decode(frames[1].payload.clone()).unwrap();
        assert_eq!(header.body_size, 10_000);

        let sizes: Vec<usize> = frames[2..].iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![4088, 4088, 1824]);
        assert!(conn.transport().sent.iter().all(|f| f.len() <= 4096));
    }

    #[test]
    fn test_publish_empty_body() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        clear_sent(&mut conn);

        conn.basic_publish(
            channel,
            BasicPublish::default(),
            BasicProperties::default(),
            b"",
        )
        .unwrap();
        assert_eq!(sent_frames(&conn).len(), 2);
    }

    #[test]
    fn test_publisher_confirms() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);

        let mut reply = conn.confirm_select(channel).unwrap();
        conn.on_data(&server(channel, Method::ConfirmSelectOk)).unwrap();
        reply.try_take().unwrap().unwrap();

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let seq = conn
                .basic_publish(
                    channel,
                    BasicPublish::default(),
                    BasicProperties::default(),
                    b"x",
                )
                .unwrap();
            seqs.push(seq.unwrap());
        }
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(conn.unconfirmed_count(channel), Some(3));

        conn.on_data(&server(
            channel,
            Method::BasicAck {
                delivery_tag: 2,
                multiple: true,
            },
        ))
        .unwrap();
        assert_eq!(conn.unconfirmed_count(channel), Some(1));

        conn.on_data(&server(
            channel,
            Method::BasicNack {
                delivery_tag: 3,
                multiple: false,
                requeue: false,
            },
        ))
        .unwrap();
        assert_eq!(conn.unconfirmed_count(channel), Some(0));
    }

    #[test]
    fn test_ack_nack_reject_encode() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        clear_sent(&mut conn);

        conn.basic_ack(channel, 5, true).unwrap();
        conn.basic_nack(channel, 6, false, true).unwrap();
        conn.basic_reject(channel, 7, false).unwrap();

        assert_eq!(
            sent_methods(&conn),
            vec![
                (
                    1,
                    Method::BasicAck {
                        delivery_tag: 5,
                        multiple: true
                    }
                ),
                (
                    1,
                    Method::BasicNack {
                        delivery_tag: 6,
                        multiple: false,
                        requeue: true
                    }
                ),
                (
                    1,
                    Method::BasicReject {
                        delivery_tag: 7,
                        requeue: false
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_server_cancel_ends_consumer() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut messages = consume(&mut conn, channel);
        clear_sent(&mut conn);

        conn.on_data(&server(
            channel,
            Method::BasicCancel {
                consumer_tag: "ctag-1".into(),
                no_wait: false,
            },
        ))
        .unwrap();

        assert!(matches!(
            messages.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(
            sent_methods(&conn),
            vec![(
                1,
                Method::BasicCancelOk {
                    consumer_tag: "ctag-1".into()
                }
            )]
        );
    }

    #[test]
    fn test_client_cancel() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut messages = consume(&mut conn, channel);

        let mut reply = conn.basic_cancel(channel, "ctag-1").unwrap();
        conn.on_data(&server(
            channel,
            Method::BasicCancelOk {
                consumer_tag: "ctag-1".into(),
            },
        ))
        .unwrap();
        assert_eq!(reply.try_take().unwrap().unwrap(), "ctag-1");
        assert!(matches!(
            messages.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_server_connection_close_fails_everything() {
        let mut conn = open_connection();
        let first = open_channel(&mut conn);
        let second = open_channel(&mut conn);
        let mut declare = conn.queue_declare(first, QueueDeclare::new("a")).unwrap();
        let mut purge = conn.queue_purge(second, "b").unwrap();
        clear_sent(&mut conn);

        conn.on_data(&server(
            0,
            Method::ConnectionClose(Close {
                reply_code: 320,
                reply_text: "CONNECTION_FORCED".into(),
                class_id: 0,
                method_id: 0,
            }),
        ))
        .unwrap();

        assert!(matches!(
            declare.try_take(),
            Some(Err(AmqpError::ConnectionClosed { code: 320, .. }))
        ));
        assert!(matches!(
            purge.try_take(),
            Some(Err(AmqpError::ConnectionClosed { code: 320, .. }))
        ));
        assert_eq!(sent_methods(&conn), vec![(0, Method::ConnectionCloseOk)]);
        assert!(conn.transport().closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.channel_ids().is_empty());
    }

    #[test]
    fn test_client_connection_close() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut declare = conn.queue_declare(channel, QueueDeclare::new("a")).unwrap();

        let mut closing = conn.close(REPLY_SUCCESS, "shutdown").unwrap();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(matches!(
            conn.open_channel(None),
            Err(AmqpError::InvalidState { state: "closing", .. })
        ));

        conn.on_data(&server(0, Method::ConnectionCloseOk)).unwrap();
        closing.try_take().unwrap().unwrap();
        assert!(matches!(
            declare.try_take(),
            Some(Err(AmqpError::ConnectionClosed { code: 200, .. }))
        ));
        assert!(conn.transport().closed);
    }

    #[test]
    fn test_transport_loss() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);
        let mut purge = conn.queue_purge(channel, "a").unwrap();

        conn.on_transport_closed("connection reset");
        match purge.try_take() {
            Some(Err(AmqpError::ConnectionClosed { code, text, .. })) => {
                assert_eq!(code, 0);
                assert_eq!(text, "connection reset");
            }
            other => panic!("expected connection closed, got {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_failure_releases_slot() {
        let mut conn = open_connection();
        let channel = open_channel(&mut conn);

        conn.transport_mut().fail = true;
        assert!(matches!(
            conn.queue_purge(channel, "a"),
            Err(AmqpError::Transport(_))
        ));

        conn.transport_mut().fail = false;
        assert!(conn.queue_purge(channel, "a").is_ok());
    }
}
