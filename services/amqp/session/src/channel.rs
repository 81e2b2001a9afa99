//! Per-channel state kept by the engine.

use crate::delivery::{Delivery, Message};
use crate::error::AmqpError;
use crate::reply::Continuation;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel lifecycle; a closed channel is simply absent from the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// channel.open sent, waiting for open-ok
    Opening,
    /// Usable
    Open,
    /// channel.close sent, waiting for close-ok
    Closing,
}

impl ChannelStatus {
    /// Lowercase name for errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Opening => "opening",
            ChannelStatus::Open => "open",
            ChannelStatus::Closing => "closing",
        }
    }
}

/// Publisher-confirm bookkeeping for a channel in confirm mode
#[derive(Debug)]
pub(crate) struct ConfirmTracker {
    next_seq: u64,
    outstanding: BTreeSet<u64>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            outstanding: BTreeSet::new(),
        }
    }

    /// Sequence number for the next publish
    pub fn next_publish(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.insert(seq);
        seq
    }

    /// Settle `tag`, or every tag up to it when `multiple`; returns the count
    pub fn settle(&mut self, tag: u64, multiple: bool) -> usize {
        if multiple {
            let rest = match tag.checked_add(1) {
                Some(bound) => self.outstanding.split_off(&bound),
                None => BTreeSet::new(),
            };
            let settled = std::mem::replace(&mut self.outstanding, rest);
            settled.len()
        } else {
            usize::from(self.outstanding.remove(&tag))
        }
    }

    pub fn unconfirmed(&self) -> usize {
        self.outstanding.len()
    }
}

/// One multiplexed channel
#[derive(Debug)]
pub(crate) struct ChannelContext {
    pub id: u16,
    pub status: ChannelStatus,
    pub pending: Option<Continuation>,
    pub delivery: Option<Delivery>,
    pub consumers: HashMap<String, mpsc::UnboundedSender<Message>>,
    pub confirms: Option<ConfirmTracker>,
}

impl ChannelContext {
    /// A channel waiting for open-ok
    pub fn opening(id: u16, pending: Continuation) -> Self {
        Self {
            id,
            status: ChannelStatus::Opening,
            pending: Some(pending),
            delivery: None,
            consumers: HashMap::new(),
            confirms: None,
        }
    }

    /// Fill the single continuation slot
    pub fn install(&mut self, continuation: Continuation) -> Result<(), AmqpError> {
        if self.pending.is_some() {
            return Err(AmqpError::ChannelBusy(self.id));
        }
        self.pending = Some(continuation);
        Ok(())
    }

    /// Fail whatever is pending and release deliveries and consumers
    pub fn fail(mut self, err: AmqpError) {
        if let Some(pending) = self.pending.take() {
            pending.fail(err);
        }
        if self.delivery.take().is_some() {
            debug!("Dropping partial delivery on channel {}", self.id);
        }
        // consumer streams end when their senders drop
        self.consumers.clear();
    }

    /// Hand the active delivery to its consumer if it is complete
    pub fn complete_delivery(&mut self) {
        let delivery = match self.delivery.take() {
            Some(delivery) if delivery.is_complete() => delivery,
            other => {
                self.delivery = other;
                return;
            }
        };
        let message = delivery.into_message();
        match self.consumers.get(&message.consumer_tag) {
            Some(sink) => {
                let tag = message.delivery_tag;
                if sink.send(message).is_err() {
                    warn!(
                        "Consumer on channel {} went away, dropping delivery {}",
                        self.id, tag
                    );
                }
            }
            None => warn!(
                "No consumer '{}' on channel {}, dropping delivery {}",
                message.consumer_tag, self.id, message.delivery_tag
            ),
        }
    }
}
