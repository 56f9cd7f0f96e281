//! AMQP 0-9-1 Wire Framing
//!
//! Every frame on the wire is a 7-byte header (1-byte type, 2-byte channel,
//! 4-byte payload length), the payload, and a single end-marker byte
//! (`0xCE`). Four frame types exist: method (1), content header (2), content
//! body (3) and heartbeat (8).
//!
//! [`parse`] implements the incremental contract the connection relies on:
//! it either consumes one whole frame or consumes nothing and reports
//! `NeedMore` — a prefix of a frame is never consumed.

use bytes::BytesMut;

use crate::codec::{Decoder, Encoder};
use crate::error::{Error, Result};
use crate::message::BasicProperties;
use crate::method::Method;

/// Frame type octets.
pub const FRAME_METHOD: u8 = 1;
/// Content header frame type.
pub const FRAME_HEADER: u8 = 2;
/// Content body frame type.
pub const FRAME_BODY: u8 = 3;
/// Heartbeat frame type.
pub const FRAME_HEARTBEAT: u8 = 8;

/// Every frame ends with this marker byte.
pub const FRAME_END: u8 = 0xCE;

/// Header + end-marker bytes surrounding a payload.
pub const FRAME_OVERHEAD: usize = 8;

/// The 8-byte protocol header opening every connection:
/// `AMQP` followed by 0, 0, 9, 1.
pub const PROTOCOL_HEADER: [u8; 8] = [0x41, 0x4D, 0x51, 0x50, 0x00, 0x00, 0x09, 0x01];

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A method frame: class, method and arguments.
    Method { channel: u16, method: Method },
    /// A content header frame announcing body size and properties.
    Header {
        channel: u16,
        class_id: u16,
        body_size: u64,
        properties: BasicProperties,
    },
    /// A slice of message body.
    Body { channel: u16, payload: Vec<u8> },
    /// A liveness probe; always on channel 0.
    Heartbeat,
}

impl Frame {
    /// The channel this frame addresses; heartbeats are channel 0.
    pub fn channel(&self) -> u16 {
        match self {
            Frame::Method { channel, .. }
            | Frame::Header { channel, .. }
            | Frame::Body { channel, .. } => *channel,
            Frame::Heartbeat => 0,
        }
    }

    /// Encode this frame into `out` as one contiguous byte run.
    pub fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let mut payload = Encoder::new();
        let frame_type = match self {
            Frame::Method { method, .. } => {
                method.encode(&mut payload)?;
                FRAME_METHOD
            }
            Frame::Header {
                class_id,
                body_size,
                properties,
                ..
            } => {
                payload.put_u16(*class_id);
                payload.put_u16(0);
                payload.put_u64(*body_size);
                properties.encode(&mut payload)?;
                FRAME_HEADER
            }
            Frame::Body { payload: body, .. } => {
                payload.put_bytes(body);
                FRAME_BODY
            }
            Frame::Heartbeat => FRAME_HEARTBEAT,
        };

        let payload = payload.finish();
        let mut head = Encoder::with_capacity(FRAME_OVERHEAD + payload.len());
        head.put_u8(frame_type);
        head.put_u16(self.channel());
        head.put_u32(payload.len() as u32);
        out.extend_from_slice(&head.finish());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&[FRAME_END]);
        Ok(())
    }
}

/// Outcome of a [`parse`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// One frame decoded; `consumed` bytes were taken from the buffer.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds less than one whole frame; nothing was consumed.
    NeedMore,
}

/// Decode at most one frame from the front of `buffer`.
///
/// Returns `NeedMore` without consuming anything while the buffer holds less
/// than a whole frame. A wrong end-marker or an undecodable payload is a
/// codec error, fatal to the connection.
pub fn parse(buffer: &[u8]) -> Result<Parsed> {
    if buffer.len() < FRAME_OVERHEAD {
        return Ok(Parsed::NeedMore);
    }

    let frame_type = buffer[0];
    let channel = u16::from_be_bytes([buffer[1], buffer[2]]);
    let size = u32::from_be_bytes([buffer[3], buffer[4], buffer[5], buffer[6]]) as usize;

    let total = FRAME_OVERHEAD + size;
    if buffer.len() < total {
        return Ok(Parsed::NeedMore);
    }

    let payload = &buffer[7..7 + size];
    let end = buffer[7 + size];
    if end != FRAME_END {
        return Err(Error::codec(format!(
            "frame-end marker is 0x{:02x}, expected 0x{:02x}",
            end, FRAME_END
        )));
    }

    let frame = match frame_type {
        FRAME_METHOD => {
            let mut decoder = Decoder::new(payload);
            let method = Method::decode(&mut decoder)?;
            if decoder.remaining() != 0 {
                return Err(Error::codec("method frame has trailing bytes"));
            }
            Frame::Method { channel, method }
        }
        FRAME_HEADER => {
            let mut decoder = Decoder::new(payload);
            let class_id = decoder.read_u16()?;
            let weight = decoder.read_u16()?;
            if weight != 0 {
                return Err(Error::codec(format!("header weight is {}, must be 0", weight)));
            }
            let body_size = decoder.read_u64()?;
            let properties = BasicProperties::decode(&mut decoder)?;
            if decoder.remaining() != 0 {
                return Err(Error::codec("header frame has trailing bytes"));
            }
            Frame::Header {
                channel,
                class_id,
                body_size,
                properties,
            }
        }
        FRAME_BODY => Frame::Body {
            channel,
            payload: payload.to_vec(),
        },
        FRAME_HEARTBEAT => {
            if channel != 0 {
                return Err(Error::codec(format!(
                    "heartbeat on channel {}, must be 0",
                    channel
                )));
            }
            if size != 0 {
                return Err(Error::codec("heartbeat frame has a payload"));
            }
            Frame::Heartbeat
        }
        other => return Err(Error::codec(format!("unknown frame type {}", other))),
    };

    Ok(Parsed::Frame { frame, consumed: total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    fn encode(frame: &Frame) -> BytesMut {
        let mut out = BytesMut::new();
        frame.encode(&mut out).unwrap();
        out
    }

    fn parse_one(bytes: &[u8]) -> (Frame, usize) {
        match parse(bytes).unwrap() {
            Parsed::Frame { frame, consumed } => (frame, consumed),
            Parsed::NeedMore => panic!("expected a full frame"),
        }
    }

    #[test]
    fn test_heartbeat_wire_form() {
        let bytes = encode(&Frame::Heartbeat);
        assert_eq!(&bytes[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn test_method_frame_round_trip() {
        let frame = Frame::Method {
            channel: 1,
            method: Method::QueuePurge { queue: "q1".into(), no_wait: false },
        };
        let bytes = encode(&frame);
        let (decoded, consumed) = parse_one(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_header_frame_round_trip() {
        let frame = Frame::Header {
            channel: 3,
            class_id: 60,
            body_size: 10_000,
            properties: BasicProperties {
                delivery_mode: Some(2),
                ..BasicProperties::default()
            },
        };
        let bytes = encode(&frame);
        let (decoded, consumed) = parse_one(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_body_frame_round_trip() {
        let frame = Frame::Body { channel: 2, payload: vec![7; 100] };
        let bytes = encode(&frame);
        let (decoded, consumed) = parse_one(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_length_field_matches_payload() {
        let frame = Frame::Body { channel: 1, payload: vec![0xAB; 42] };
        let bytes = encode(&frame);
        let announced = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        assert_eq!(announced, 42);
        assert_eq!(bytes.len(), FRAME_OVERHEAD + 42);
        assert_eq!(bytes[bytes.len() - 1], FRAME_END);
    }

    #[test]
    fn test_every_shorter_prefix_needs_more_and_consumes_nothing() {
        let frame = Frame::Method {
            channel: 1,
            method: Method::QueueDeclare {
                queue: "q1".into(),
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: crate::types::FieldTable::new(),
            },
        };
        let bytes = encode(&frame);
        for len in 0..bytes.len() {
            assert_eq!(parse(&bytes[..len]).unwrap(), Parsed::NeedMore, "prefix {}", len);
        }
        let (decoded, consumed) = parse_one(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_bad_end_marker_is_a_codec_error() {
        let mut bytes = encode(&Frame::Heartbeat);
        let last = bytes.len() - 1;
        bytes[last] = 0x00;
        assert!(matches!(parse(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn test_heartbeat_on_nonzero_channel_is_rejected() {
        let bytes = [8, 0, 5, 0, 0, 0, 0, 0xCE];
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn test_unknown_frame_type_is_rejected() {
        let bytes = [4, 0, 0, 0, 0, 0, 0, 0xCE];
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn test_nonzero_header_weight_is_rejected() {
        let frame = Frame::Header {
            channel: 1,
            class_id: 60,
            body_size: 0,
            properties: BasicProperties::default(),
        };
        let mut bytes = encode(&frame);
        // weight lives right after the class id in the payload
        bytes[9] = 0;
        bytes[10] = 1;
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn test_two_frames_back_to_back_parse_one_at_a_time() {
        let first = Frame::Heartbeat;
        let second = Frame::Body { channel: 1, payload: vec![1, 2, 3] };
        let mut bytes = encode(&first);
        bytes.extend_from_slice(&encode(&second));

        let (f1, c1) = parse_one(&bytes);
        assert_eq!(f1, first);
        let (f2, c2) = parse_one(&bytes[c1..]);
        assert_eq!(f2, second);
        assert_eq!(c1 + c2, bytes.len());
    }
}
