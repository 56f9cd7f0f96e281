//! AMQP 0-9-1 Messages and Content Properties
//!
//! A published or delivered message is carried as a method frame followed by
//! a content header frame and zero or more body frames. The header frame
//! announces the total body size and a 16-bit property-flags mask telling
//! which of the optional [`BasicProperties`] follow, in canonical order.
//!
//! # Examples
//!
//! ```rust
//! use warren_amqp::message::Envelope;
//!
//! let envelope = Envelope::builder()
//!     .content_type("application/json")
//!     .delivery_mode(2)
//!     .body(br#"{"event":"created"}"#.to_vec())
//!     .build();
//!
//! assert_eq!(envelope.body.len(), 19);
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::{Decoder, Encoder};
use crate::error::Result;
use crate::types::{FieldTable, Timestamp};

/// Property-flag bit positions in the content header mask.
mod flag {
    pub const CONTENT_TYPE: u16 = 1 << 15;
    pub const CONTENT_ENCODING: u16 = 1 << 14;
    pub const HEADERS: u16 = 1 << 13;
    pub const DELIVERY_MODE: u16 = 1 << 12;
    pub const PRIORITY: u16 = 1 << 11;
    pub const CORRELATION_ID: u16 = 1 << 10;
    pub const REPLY_TO: u16 = 1 << 9;
    pub const EXPIRATION: u16 = 1 << 8;
    pub const MESSAGE_ID: u16 = 1 << 7;
    pub const TIMESTAMP: u16 = 1 << 6;
    pub const MESSAGE_TYPE: u16 = 1 << 5;
    pub const USER_ID: u16 = 1 << 4;
    pub const APP_ID: u16 = 1 << 3;
    pub const CLUSTER_ID: u16 = 1 << 2;
}

/// The optional content properties of the basic class.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// The property-flags mask announcing which fields are present.
    pub fn flags(&self) -> u16 {
        let mut mask = 0;
        if self.content_type.is_some() {
            mask |= flag::CONTENT_TYPE;
        }
        if self.content_encoding.is_some() {
            mask |= flag::CONTENT_ENCODING;
        }
        if self.headers.is_some() {
            mask |= flag::HEADERS;
        }
        if self.delivery_mode.is_some() {
            mask |= flag::DELIVERY_MODE;
        }
        if self.priority.is_some() {
            mask |= flag::PRIORITY;
        }
        if self.correlation_id.is_some() {
            mask |= flag::CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            mask |= flag::REPLY_TO;
        }
        if self.expiration.is_some() {
            mask |= flag::EXPIRATION;
        }
        if self.message_id.is_some() {
            mask |= flag::MESSAGE_ID;
        }
        if self.timestamp.is_some() {
            mask |= flag::TIMESTAMP;
        }
        if self.message_type.is_some() {
            mask |= flag::MESSAGE_TYPE;
        }
        if self.user_id.is_some() {
            mask |= flag::USER_ID;
        }
        if self.app_id.is_some() {
            mask |= flag::APP_ID;
        }
        if self.cluster_id.is_some() {
            mask |= flag::CLUSTER_ID;
        }
        mask
    }

    /// Encode the flags mask and the present properties in canonical order.
    pub fn encode(&self, encoder: &mut Encoder) -> Result<()> {
        encoder.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.content_encoding {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.headers {
            encoder.put_table(v)?;
        }
        if let Some(v) = self.delivery_mode {
            encoder.put_u8(v);
        }
        if let Some(v) = self.priority {
            encoder.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.reply_to {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.expiration {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.message_id {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = self.timestamp {
            encoder.put_u64(v);
        }
        if let Some(v) = &self.message_type {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.user_id {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.app_id {
            encoder.put_short_string(v)?;
        }
        if let Some(v) = &self.cluster_id {
            encoder.put_short_string(v)?;
        }
        Ok(())
    }

    /// Decode the flags mask and the announced properties.
    pub fn decode(decoder: &mut Decoder<'_>) -> Result<BasicProperties> {
        let mask = decoder.read_u16()?;
        let mut properties = BasicProperties::default();
        if mask & flag::CONTENT_TYPE != 0 {
            properties.content_type = Some(decoder.read_short_string()?);
        }
        if mask & flag::CONTENT_ENCODING != 0 {
            properties.content_encoding = Some(decoder.read_short_string()?);
        }
        if mask & flag::HEADERS != 0 {
            properties.headers = Some(decoder.read_table()?);
        }
        if mask & flag::DELIVERY_MODE != 0 {
            properties.delivery_mode = Some(decoder.read_u8()?);
        }
        if mask & flag::PRIORITY != 0 {
            properties.priority = Some(decoder.read_u8()?);
        }
        if mask & flag::CORRELATION_ID != 0 {
            properties.correlation_id = Some(decoder.read_short_string()?);
        }
        if mask & flag::REPLY_TO != 0 {
            properties.reply_to = Some(decoder.read_short_string()?);
        }
        if mask & flag::EXPIRATION != 0 {
            properties.expiration = Some(decoder.read_short_string()?);
        }
        if mask & flag::MESSAGE_ID != 0 {
            properties.message_id = Some(decoder.read_short_string()?);
        }
        if mask & flag::TIMESTAMP != 0 {
            properties.timestamp = Some(decoder.read_u64()?);
        }
        if mask & flag::MESSAGE_TYPE != 0 {
            properties.message_type = Some(decoder.read_short_string()?);
        }
        if mask & flag::USER_ID != 0 {
            properties.user_id = Some(decoder.read_short_string()?);
        }
        if mask & flag::APP_ID != 0 {
            properties.app_id = Some(decoder.read_short_string()?);
        }
        if mask & flag::CLUSTER_ID != 0 {
            properties.cluster_id = Some(decoder.read_short_string()?);
        }
        Ok(properties)
    }
}

/// A message as the caller hands it to `publish`: properties plus body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

impl Envelope {
    /// An envelope with no properties.
    pub fn new(body: Vec<u8>) -> Self {
        Envelope { properties: BasicProperties::default(), body }
    }

    /// A UTF-8 text envelope.
    pub fn text(body: impl Into<String>) -> Self {
        Envelope::new(body.into().into_bytes())
    }

    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    properties: BasicProperties,
    body: Vec<u8>,
}

impl EnvelopeBuilder {
    pub fn content_type(mut self, v: impl Into<String>) -> Self {
        self.properties.content_type = Some(v.into());
        self
    }

    pub fn content_encoding(mut self, v: impl Into<String>) -> Self {
        self.properties.content_encoding = Some(v.into());
        self
    }

    pub fn headers(mut self, v: FieldTable) -> Self {
        self.properties.headers = Some(v);
        self
    }

    pub fn delivery_mode(mut self, v: u8) -> Self {
        self.properties.delivery_mode = Some(v);
        self
    }

    pub fn priority(mut self, v: u8) -> Self {
        self.properties.priority = Some(v);
        self
    }

    pub fn correlation_id(mut self, v: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(v.into());
        self
    }

    pub fn reply_to(mut self, v: impl Into<String>) -> Self {
        self.properties.reply_to = Some(v.into());
        self
    }

    pub fn expiration(mut self, v: impl Into<String>) -> Self {
        self.properties.expiration = Some(v.into());
        self
    }

    pub fn message_id(mut self, v: impl Into<String>) -> Self {
        self.properties.message_id = Some(v.into());
        self
    }

    pub fn timestamp(mut self, v: Timestamp) -> Self {
        self.properties.timestamp = Some(v);
        self
    }

    pub fn message_type(mut self, v: impl Into<String>) -> Self {
        self.properties.message_type = Some(v.into());
        self
    }

    pub fn user_id(mut self, v: impl Into<String>) -> Self {
        self.properties.user_id = Some(v.into());
        self
    }

    pub fn app_id(mut self, v: impl Into<String>) -> Self {
        self.properties.app_id = Some(v.into());
        self
    }

    pub fn body(mut self, v: Vec<u8>) -> Self {
        self.body = v;
        self
    }

    pub fn build(self) -> Envelope {
        Envelope { properties: self.properties, body: self.body }
    }
}

/// How a message reached this client.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryKind {
    /// `basic.deliver` to a registered consumer.
    Deliver { consumer_tag: String },
    /// Reply to `basic.get`.
    Get { message_count: u32 },
    /// `basic.return` of an unroutable mandatory/immediate publish.
    Return { reply_code: u16, reply_text: String },
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub envelope: Envelope,
    pub exchange: String,
    pub routing_key: String,
    /// Server-assigned tag for ack/nack/reject. Zero for returned messages.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub kind: DeliveryKind,
}

impl Message {
    /// The body interpreted as UTF-8, if it is.
    pub fn body_as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.envelope.body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldValue;

    fn round_trip(properties: &BasicProperties) -> BasicProperties {
        let mut encoder = Encoder::new();
        properties.encode(&mut encoder).unwrap();
        let bytes = encoder.finish();
        let mut decoder = Decoder::new(&bytes);
        let decoded = BasicProperties::decode(&mut decoder).unwrap();
        assert_eq!(decoder.remaining(), 0);
        decoded
    }

    #[test]
    fn test_empty_properties_is_zero_mask() {
        let properties = BasicProperties::default();
        assert_eq!(properties.flags(), 0);

        let mut encoder = Encoder::new();
        properties.encode(&mut encoder).unwrap();
        assert_eq!(&encoder.finish()[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_full_properties_round_trip() {
        let mut headers = FieldTable::new();
        headers.insert("retry", FieldValue::LongInt(3));

        let properties = BasicProperties {
            content_type: Some("text/plain".into()),
            content_encoding: Some("identity".into()),
            headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("corr-1".into()),
            reply_to: Some("amq.rabbitmq.reply-to".into()),
            expiration: Some("60000".into()),
            message_id: Some("m-1".into()),
            timestamp: Some(1_700_000_000),
            message_type: Some("created".into()),
            user_id: Some("guest".into()),
            app_id: Some("app".into()),
            cluster_id: Some("c".into()),
        };
        assert_eq!(round_trip(&properties), properties);
    }

    #[test]
    fn test_sparse_properties_round_trip() {
        let properties = BasicProperties {
            delivery_mode: Some(1),
            app_id: Some("warren".into()),
            ..BasicProperties::default()
        };
        assert_eq!(properties.flags(), (1 << 12) | (1 << 3));
        assert_eq!(round_trip(&properties), properties);
    }

    #[test]
    fn test_flag_bit_positions() {
        let with_content_type = BasicProperties {
            content_type: Some("x".into()),
            ..BasicProperties::default()
        };
        assert_eq!(with_content_type.flags(), 0x8000);

        let with_cluster_id = BasicProperties {
            cluster_id: Some("x".into()),
            ..BasicProperties::default()
        };
        assert_eq!(with_cluster_id.flags(), 0x0004);
    }

    #[test]
    fn test_envelope_builder() {
        let envelope = Envelope::builder()
            .content_type("application/octet-stream")
            .delivery_mode(2)
            .priority(9)
            .body(vec![1, 2, 3])
            .build();
        assert_eq!(envelope.properties.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(envelope.properties.delivery_mode, Some(2));
        assert_eq!(envelope.body, vec![1, 2, 3]);
    }

    #[test]
    fn test_message_body_as_text() {
        let message = Message {
            envelope: Envelope::text("hello"),
            exchange: "ex".into(),
            routing_key: "r".into(),
            delivery_tag: 1,
            redelivered: false,
            kind: DeliveryKind::Deliver { consumer_tag: "t".into() },
        };
        assert_eq!(message.body_as_text(), Some("hello"));
    }
}
