//! Content header frames and basic-class message properties.
//!
//! A content header carries the body size and a 16-bit presence mask that
//! selects which of the fixed, ordered property fields follow. Fields are
//! read and written high bit first, and only when present.

use crate::codec::{get_u16, get_u64, get_u8, get_short_string, put_short_string};
use crate::frame::{FrameType, FrameWriter};
use crate::table::{get_table, put_table, FieldTable};
use crate::WireError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Property presence mask, highest bit first on the wire
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PropertyFlags: u16 {
        /// content-type (shortstr)
        const CONTENT_TYPE = 1 << 15;
        /// content-encoding (shortstr)
        const CONTENT_ENCODING = 1 << 14;
        /// headers (table)
        const HEADERS = 1 << 13;
        /// delivery-mode (octet)
        const DELIVERY_MODE = 1 << 12;
        /// priority (octet)
        const PRIORITY = 1 << 11;
        /// correlation-id (shortstr)
        const CORRELATION_ID = 1 << 10;
        /// reply-to (shortstr)
        const REPLY_TO = 1 << 9;
        /// expiration (shortstr)
        const EXPIRATION = 1 << 8;
        /// message-id (shortstr)
        const MESSAGE_ID = 1 << 7;
        /// timestamp (u64)
        const TIMESTAMP = 1 << 6;
        /// type (shortstr)
        const TYPE = 1 << 5;
        /// user-id (shortstr)
        const USER_ID = 1 << 4;
        /// app-id (shortstr)
        const APP_ID = 1 << 3;
        /// cluster-id (shortstr)
        const CLUSTER_ID = 1 << 2;
    }
}

/// Continuation bit: another flags word follows (never used by the basic class)
const FLAG_CONTINUATION: u16 = 1;

/// Basic-class message properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    /// MIME content type
    pub content_type: Option<String>,
    /// MIME content encoding
    pub content_encoding: Option<String>,
    /// Application headers
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    /// Priority 0..9
    pub priority: Option<u8>,
    /// Application correlation identifier
    pub correlation_id: Option<String>,
    /// Address to reply to
    pub reply_to: Option<String>,
    /// Expiration specification
    pub expiration: Option<String>,
    /// Application message identifier
    pub message_id: Option<String>,
    /// Message timestamp
    pub timestamp: Option<u64>,
    /// Message type name
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Creating user id
    pub user_id: Option<String>,
    /// Creating application id
    pub app_id: Option<String>,
    /// Deprecated cluster id
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// Presence mask implied by the populated fields
    pub fn flags(&self) -> PropertyFlags {
        let mut flags = PropertyFlags::empty();
        flags.set(PropertyFlags::CONTENT_TYPE, self.content_type.is_some());
        flags.set(
            PropertyFlags::CONTENT_ENCODING,
            self.content_encoding.is_some(),
        );
        flags.set(PropertyFlags::HEADERS, self.headers.is_some());
        flags.set(PropertyFlags::DELIVERY_MODE, self.delivery_mode.is_some());
        flags.set(PropertyFlags::PRIORITY, self.priority.is_some());
        flags.set(PropertyFlags::CORRELATION_ID, self.correlation_id.is_some());
        flags.set(PropertyFlags::REPLY_TO, self.reply_to.is_some());
        flags.set(PropertyFlags::EXPIRATION, self.expiration.is_some());
        flags.set(PropertyFlags::MESSAGE_ID, self.message_id.is_some());
        flags.set(PropertyFlags::TIMESTAMP, self.timestamp.is_some());
        flags.set(PropertyFlags::TYPE, self.kind.is_some());
        flags.set(PropertyFlags::USER_ID, self.user_id.is_some());
        flags.set(PropertyFlags::APP_ID, self.app_id.is_some());
        flags.set(PropertyFlags::CLUSTER_ID, self.cluster_id.is_some());
        flags
    }

    /// Encode the presence mask followed by the present fields
    pub fn encode(&self, buf: &mut BytesMut) -> Result<usize, WireError> {
        let start = buf.len();
        buf.put_u16(self.flags().bits());

        put_optional_short(buf, &self.content_type)?;
        put_optional_short(buf, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            put_table(buf, headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            buf.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            buf.put_u8(priority);
        }
        put_optional_short(buf, &self.correlation_id)?;
        put_optional_short(buf, &self.reply_to)?;
        put_optional_short(buf, &self.expiration)?;
        put_optional_short(buf, &self.message_id)?;
        if let Some(timestamp) = self.timestamp {
            buf.put_u64(timestamp);
        }
        put_optional_short(buf, &self.kind)?;
        put_optional_short(buf, &self.user_id)?;
        put_optional_short(buf, &self.app_id)?;
        put_optional_short(buf, &self.cluster_id)?;

        Ok(buf.len() - start)
    }

    /// Decode the presence mask and the fields it selects
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let raw = get_u16(buf)?;
        if raw & FLAG_CONTINUATION != 0 {
            return Err(WireError::Malformed("property flags continuation is not supported"));
        }
        let flags = PropertyFlags::from_bits_truncate(raw);

        let content_type = optional_short(buf, flags, PropertyFlags::CONTENT_TYPE)?;
        let content_encoding = optional_short(buf, flags, PropertyFlags::CONTENT_ENCODING)?;
        let headers = if flags.contains(PropertyFlags::HEADERS) {
            Some(get_table(buf)?)
        } else {
            None
        };
        let delivery_mode = if flags.contains(PropertyFlags::DELIVERY_MODE) {
            Some(get_u8(buf)?)
        } else {
            None
        };
        let priority = if flags.contains(PropertyFlags::PRIORITY) {
            Some(get_u8(buf)?)
        } else {
            None
        };
        let correlation_id = optional_short(buf, flags, PropertyFlags::CORRELATION_ID)?;
        let reply_to = optional_short(buf, flags, PropertyFlags::REPLY_TO)?;
        let expiration = optional_short(buf, flags, PropertyFlags::EXPIRATION)?;
        let message_id = optional_short(buf, flags, PropertyFlags::MESSAGE_ID)?;
        let timestamp = if flags.contains(PropertyFlags::TIMESTAMP) {
            Some(get_u64(buf)?)
        } else {
            None
        };
        let kind = optional_short(buf, flags, PropertyFlags::TYPE)?;
        let user_id = optional_short(buf, flags, PropertyFlags::USER_ID)?;
        let app_id = optional_short(buf, flags, PropertyFlags::APP_ID)?;
        let cluster_id = optional_short(buf, flags, PropertyFlags::CLUSTER_ID)?;

        Ok(Self {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            kind,
            user_id,
            app_id,
            cluster_id,
        })
    }
}

fn put_optional_short(buf: &mut BytesMut, value: &Option<String>) -> Result<(), WireError> {
    if let Some(value) = value {
        put_short_string(buf, value)?;
    }
    Ok(())
}

fn optional_short(
    buf: &mut impl Buf,
    flags: PropertyFlags,
    flag: PropertyFlags,
) -> Result<Option<String>, WireError> {
    if flags.contains(flag) {
        get_short_string(buf).map(Some)
    } else {
        Ok(None)
    }
}

/// Payload of a content header frame
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    /// Class of the content (60 for basic)
    pub class_id: u16,
    /// Total body size across all body frames
    pub body_size: u64,
    /// Message properties
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Decode a header frame payload. The weight field is read and ignored.
    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        let class_id = get_u16(&mut payload)?;
        let _weight = get_u16(&mut payload)?;
        let body_size = get_u64(&mut payload)?;
        let properties = BasicProperties::decode(&mut payload)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }

    /// Encode as a complete header frame on `channel`
    pub fn encode(&self, channel: u16, frame_max: usize) -> Result<Bytes, WireError> {
        let mut frame = FrameWriter::new(FrameType::Header, channel);
        let buf = frame.buf_mut();
        buf.put_u16(self.class_id);
        buf.put_u16(0); // weight
        buf.put_u64(self.body_size);
        self.properties.encode(buf)?;
        frame.finish(frame_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FRAME_HEADER_SIZE;
    use crate::table::FieldValue;

    #[test]
    fn test_empty_properties() {
        let props = BasicProperties::default();
        let mut buf = BytesMut::new();
        assert_eq!(props.encode(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..], &[0, 0]);

        let decoded = BasicProperties::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_properties_roundtrip() {
        let mut headers = FieldTable::new();
        headers.insert("x-retry".into(), FieldValue::LongInt(3));

        let props = BasicProperties {
            content_type: Some("application/json".into()),
            headers: Some(headers),
            delivery_mode: Some(2),
            correlation_id: Some("abc".into()),
            timestamp: Some(1_700_000_000),
            app_id: Some("redb".into()),
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let expected = PropertyFlags::CONTENT_TYPE
            | PropertyFlags::HEADERS
            | PropertyFlags::DELIVERY_MODE
            | PropertyFlags::CORRELATION_ID
            | PropertyFlags::TIMESTAMP
            | PropertyFlags::APP_ID;
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), expected.bits());

        let mut bytes = buf.freeze();
        let decoded = BasicProperties::decode(&mut bytes).unwrap();
        assert_eq!(decoded, props);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_only_present_fields_are_read() {
        // priority only: mask bit 11, one octet
        let mut bytes = Bytes::from_static(&[0x08, 0x00, 5]);
        let props = BasicProperties::decode(&mut bytes).unwrap();
        assert_eq!(props.priority, Some(5));
        assert_eq!(props.content_type, None);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_properties_serialize_type_field() {
        let props = BasicProperties {
            kind: Some("order.created".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&props).unwrap();
        assert_eq!(json["type"], "order.created");
    }

    #[test]
    fn test_content_header_roundtrip() {
        let header = ContentHeader {
            class_id: 60,
            body_size: 12,
            properties: BasicProperties {
                content_type: Some("text/plain".into()),
                ..Default::default()
            },
        };
        let frame = header.encode(1, 4096).unwrap();
        assert_eq!(frame[0], FrameType::Header as u8);

        let payload = frame.slice(FRAME_HEADER_SIZE..frame.len() - 1);
        assert_eq!(ContentHeader::decode(payload).unwrap(), header);
    }
}
