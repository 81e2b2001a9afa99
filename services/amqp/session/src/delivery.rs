//! Reassembly of deliveries split over method, header and body frames.

use amqp_wire::{BasicProperties, ContentHeader, Deliver, WireError};
use bytes::{Bytes, BytesMut};
use serde::Serialize;

/// Upper bound on the body buffer reserved up front
const MAX_PREALLOC: u64 = 1024 * 1024;

/// A complete message handed to a consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    /// Channel the message arrived on
    pub channel: u16,
    /// Consumer the message is for
    pub consumer_tag: String,
    /// Tag to acknowledge with
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish
    pub routing_key: String,
    /// Message was delivered before
    pub redelivered: bool,
    /// Content properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

/// A delivery in progress on one channel
#[derive(Debug)]
pub(crate) struct Delivery {
    channel: u16,
    deliver: Deliver,
    header: Option<ContentHeader>,
    body: BytesMut,
}

impl Delivery {
    /// Start from a basic.deliver
    pub fn new(channel: u16, deliver: Deliver) -> Self {
        Self {
            channel,
            deliver,
            header: None,
            body: BytesMut::new(),
        }
    }

    /// Consumer tag of the delivery
    pub fn consumer_tag(&self) -> &str {
        &self.deliver.consumer_tag
    }

    /// Accept the content header
    pub fn on_header(&mut self, header: ContentHeader) -> Result<(), WireError> {
        if self.header.is_some() {
            return Err(WireError::Malformed("second content header for one delivery"));
        }
        self.body = BytesMut::with_capacity(header.body_size.min(MAX_PREALLOC) as usize);
        self.header = Some(header);
        Ok(())
    }

    /// Append a body chunk at the current position
    pub fn on_body(&mut self, chunk: &[u8]) -> Result<(), WireError> {
        let body_size = match &self.header {
            Some(header) => header.body_size,
            None => return Err(WireError::Malformed("content body before content header")),
        };
        let body_pos = self.body.len() as u64;
        if body_pos + chunk.len() as u64 > body_size {
            return Err(WireError::Malformed("content body overruns declared size"));
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    /// Header seen and every body byte received
    pub fn is_complete(&self) -> bool {
        match &self.header {
            Some(header) => self.body.len() as u64 == header.body_size,
            None => false,
        }
    }

    /// Turn a complete delivery into the consumer-facing message
    pub fn into_message(self) -> Message {
        let properties = self.header.map(|h| h.properties).unwrap_or_default();
        Message {
            channel: self.channel,
            consumer_tag: self.deliver.consumer_tag,
            delivery_tag: self.deliver.delivery_tag,
            exchange: self.deliver.exchange,
            routing_key: self.deliver.routing_key,
            redelivered: self.deliver.redelivered,
            properties,
            body: self.body.freeze(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliver() -> Deliver {
        Deliver {
            consumer_tag: "ctag".into(),
            delivery_tag: 1,
            redelivered: false,
            exchange: "".into(),
            routing_key: "orders".into(),
        }
    }

    fn header(body_size: u64) -> ContentHeader {
        ContentHeader {
            class_id: 60,
            body_size,
            properties: BasicProperties::default(),
        }
    }

    #[test]
    fn test_zero_length_completes_on_header() {
        let mut delivery = Delivery::new(1, deliver());
        assert!(!delivery.is_complete());
        delivery.on_header(header(0)).unwrap();
        assert!(delivery.is_complete());
        assert!(delivery.into_message().body.is_empty());
    }

    #[test]
    fn test_body_in_chunks() {
        let mut delivery = Delivery::new(1, deliver());
        delivery.on_header(header(11)).unwrap();
        delivery.on_body(b"hello ").unwrap();
        assert!(!delivery.is_complete());
        delivery.on_body(b"world").unwrap();
        assert!(delivery.is_complete());

        let message = delivery.into_message();
        assert_eq!(&message.body[..], b"hello world");
        assert_eq!(message.routing_key, "orders");
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut delivery = Delivery::new(1, deliver());
        delivery.on_header(header(3)).unwrap();
        assert!(delivery.on_body(b"four").is_err());
    }

    #[test]
    fn test_message_serializes() {
        let mut delivery = Delivery::new(2, deliver());
        delivery.on_header(header(2)).unwrap();
        delivery.on_body(b"hi").unwrap();

        let json = serde_json::to_value(delivery.into_message()).unwrap();
        assert_eq!(json["channel"], 2);
        assert_eq!(json["routing_key"], "orders");
        assert_eq!(json["properties"]["type"], serde_json::Value::Null);
    }

    #[test]
    fn test_body_without_header() {
        let mut delivery = Delivery::new(1, deliver());
        assert!(delivery.on_body(b"x").is_err());
    }
}
