//! MQTT 3.1.1 control packet encoding and decoding.
//!
//! Only the packets a QoS 0 publisher and subscriber need are supported:
//! CONNECT, CONNACK, PUBLISH, SUBSCRIBE, SUBACK, PINGREQ, PINGRESP and
//! DISCONNECT. Multi-byte integers are big-endian; string fields are a
//! 16-bit length followed by UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{MqttError, MqttResult};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;

/// Largest value representable by the remaining-length field.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Publish quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A packet received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    PingReq,
    PingResp,
    /// Any other packet type; the fixed-header byte is kept for logging.
    Other(u8),
}

/// Human-readable meaning of a CONNACK return code.
pub fn connack_message(return_code: u8) -> &'static str {
    match return_code {
        0 => "Connection accepted",
        1 => "Unacceptable protocol version",
        2 => "Identifier rejected",
        3 => "Server unavailable",
        4 => "Bad user name or password",
        5 => "Not authorized",
        _ => "Unknown return code",
    }
}

fn remaining_length_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn check_string(field: &str, s: &str) -> MqttResult<()> {
    if s.len() > usize::from(u16::MAX) {
        return Err(MqttError::MalformedPacket(format!(
            "{field} longer than 65535 bytes"
        )));
    }
    Ok(())
}

/// Total encoded size of a QoS 0 PUBLISH packet.
pub fn publish_len(topic: &str, payload_len: usize) -> usize {
    let remaining = 2 + topic.len() + payload_len;
    1 + remaining_length_len(remaining) + remaining
}

/// Append a clean-session CONNECT packet without credentials or will.
pub fn encode_connect(buf: &mut BytesMut, client_id: &str, keepalive_secs: u16) -> MqttResult<()> {
    check_string("client id", client_id)?;
    let remaining = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + client_id.len();
    buf.put_u8(CONNECT);
    put_remaining_length(buf, remaining);
    buf.put_u16(PROTOCOL_NAME.len() as u16);
    buf.put_slice(PROTOCOL_NAME);
    buf.put_u8(PROTOCOL_LEVEL);
    buf.put_u8(CLEAN_SESSION);
    buf.put_u16(keepalive_secs);
    put_string(buf, client_id);
    Ok(())
}

/// Append a QoS 0 PUBLISH packet.
pub fn encode_publish(buf: &mut BytesMut, topic: &str, payload: &[u8]) -> MqttResult<()> {
    check_string("topic", topic)?;
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(MqttError::MalformedPacket(format!(
            "invalid publish topic {topic:?}"
        )));
    }
    let remaining = 2 + topic.len() + payload.len();
    if remaining > MAX_REMAINING_LENGTH {
        return Err(MqttError::MalformedPacket("payload too large".to_string()));
    }
    buf.put_u8(PUBLISH);
    put_remaining_length(buf, remaining);
    put_string(buf, topic);
    buf.put_slice(payload);
    Ok(())
}

/// Append a SUBSCRIBE packet for one topic filter at QoS 0.
pub fn encode_subscribe(buf: &mut BytesMut, packet_id: u16, topic_filter: &str) -> MqttResult<()> {
    check_string("topic filter", topic_filter)?;
    let remaining = 2 + 2 + topic_filter.len() + 1;
    buf.put_u8(SUBSCRIBE);
    put_remaining_length(buf, remaining);
    buf.put_u16(packet_id);
    put_string(buf, topic_filter);
    buf.put_u8(QoS::AtMostOnce.level());
    Ok(())
}

pub fn encode_pingreq(buf: &mut BytesMut) {
    buf.put_slice(&[PINGREQ, 0]);
}

pub fn encode_disconnect(buf: &mut BytesMut) {
    buf.put_slice(&[DISCONNECT, 0]);
}

/// Parse the remaining-length field at the start of `src`.
///
/// Returns `(value, bytes_used)`, or `None` if more bytes are needed.
fn parse_remaining_length(src: &[u8]) -> MqttResult<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in src.iter().enumerate() {
        if i >= 4 {
            break;
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if src.len() >= 4 {
        Err(MqttError::MalformedPacket(
            "remaining length exceeds four bytes".to_string(),
        ))
    } else {
        Ok(None)
    }
}

fn take_string(body: &mut Bytes) -> MqttResult<String> {
    if body.remaining() < 2 {
        return Err(MqttError::MalformedPacket("truncated string".to_string()));
    }
    let len = usize::from(body.get_u16());
    if body.remaining() < len {
        return Err(MqttError::MalformedPacket("truncated string".to_string()));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| MqttError::MalformedPacket("string is not UTF-8".to_string()))
}

/// Decode one packet from the front of `src`.
///
/// Consumes the packet's bytes on success and returns `Ok(None)` when `src`
/// does not yet hold a complete packet.
pub fn decode(src: &mut BytesMut) -> MqttResult<Option<Packet>> {
    if src.is_empty() {
        return Ok(None);
    }
    let Some((remaining, len_bytes)) = parse_remaining_length(&src[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if src.len() < total {
        return Ok(None);
    }

    let mut frame = src.split_to(total).freeze();
    let header = frame.get_u8();
    frame.advance(len_bytes);
    let mut body = frame;

    let packet = match header & 0xF0 {
        CONNACK => {
            if body.remaining() != 2 {
                return Err(MqttError::MalformedPacket("CONNACK length".to_string()));
            }
            let flags = body.get_u8();
            Packet::ConnAck {
                session_present: flags & 0x01 != 0,
                return_code: body.get_u8(),
            }
        }
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let topic = take_string(&mut body)?;
            if qos > 0 {
                if body.remaining() < 2 {
                    return Err(MqttError::MalformedPacket("missing packet id".to_string()));
                }
                body.advance(2);
            }
            Packet::Publish {
                topic,
                payload: body,
            }
        }
        SUBACK => {
            if body.remaining() < 2 {
                return Err(MqttError::MalformedPacket("SUBACK length".to_string()));
            }
            let packet_id = body.get_u16();
            Packet::SubAck {
                packet_id,
                return_codes: body.to_vec(),
            }
        }
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        _ => Packet::Other(header),
    };
    Ok(Some(packet))
}
