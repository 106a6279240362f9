//! MQTT 3.1/3.1.1 packet framing.
//!
//! The proxy never interprets packet payloads; it only needs to know where
//! one control packet ends and the next begins so that a forwarded write is
//! always a whole number of packets. This module implements exactly that:
//! fixed-header scanning over a byte buffer and framed reads from a stream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest legal remaining-length value (four 7-bit groups).
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Framing errors.
#[derive(Debug, Error)]
pub enum MqttError {
    /// The packet-type nibble is not a known MQTT control packet.
    #[error("invalid MQTT packet type: {0}")]
    InvalidPacketType(u8),

    /// The remaining-length field used more than four bytes.
    #[error("malformed MQTT remaining length")]
    MalformedRemainingLength,

    /// The underlying stream failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for framing operations.
pub type MqttResult<T> = Result<T, MqttError>;

/// MQTT control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection request.
    Connect = 1,
    /// Connection acknowledgment.
    ConnAck = 2,
    /// Publish message.
    Publish = 3,
    /// Publish acknowledgment (QoS 1).
    PubAck = 4,
    /// Publish received (QoS 2, step 1).
    PubRec = 5,
    /// Publish release (QoS 2, step 2).
    PubRel = 6,
    /// Publish complete (QoS 2, step 3).
    PubComp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgment.
    SubAck = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment.
    UnsubAck = 11,
    /// Ping request.
    PingReq = 12,
    /// Ping response.
    PingResp = 13,
    /// Disconnect notification.
    Disconnect = 14,
    /// Authentication exchange.
    Auth = 15,
}

impl PacketType {
    /// Create a packet type from the fixed-header type nibble.
    pub fn from_u8(value: u8) -> MqttResult<Self> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::ConnAck),
            3 => Ok(Self::Publish),
            4 => Ok(Self::PubAck),
            5 => Ok(Self::PubRec),
            6 => Ok(Self::PubRel),
            7 => Ok(Self::PubComp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::SubAck),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::UnsubAck),
            12 => Ok(Self::PingReq),
            13 => Ok(Self::PingResp),
            14 => Ok(Self::Disconnect),
            15 => Ok(Self::Auth),
            other => Err(MqttError::InvalidPacketType(other)),
        }
    }

    /// Wire name, used in trace output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
            Self::Auth => "AUTH",
        }
    }
}

/// A decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Control packet type.
    pub packet_type: PacketType,
    /// Fixed-header flag nibble.
    pub flags: u8,
    /// Declared length of the variable header plus payload.
    pub remaining_length: u32,
    /// Bytes occupied by the fixed header itself.
    pub header_len: usize,
}

impl FixedHeader {
    /// Total encoded size of the packet this header describes.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.header_len + self.remaining_length as usize
    }
}

/// Try to decode one fixed header from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a packet and
/// more bytes are needed.
///
/// # Errors
///
/// Returns an error for an unknown packet type or an over-long
/// remaining-length encoding; both mean the stream is not speaking MQTT.
pub fn try_decode(buf: &[u8]) -> MqttResult<Option<FixedHeader>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let packet_type = PacketType::from_u8(buf[0] >> 4)?;
    let flags = buf[0] & 0x0F;

    let mut remaining_length: u32 = 0;
    let mut shift: u32 = 0;
    let mut header_len = 1;
    loop {
        let Some(&byte) = buf.get(header_len) else {
            return Ok(None);
        };
        header_len += 1;

        remaining_length |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(MqttError::MalformedRemainingLength);
        }
    }

    let header = FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_len,
    };
    if buf.len() < header.total_len() {
        return Ok(None);
    }
    Ok(Some(header))
}

/// One framed control packet, payload uninterpreted.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Control packet type.
    pub packet_type: PacketType,
    /// Fixed-header flag nibble.
    pub flags: u8,
    /// Variable header plus payload, verbatim.
    pub payload: Bytes,
}

impl Packet {
    /// Encode the packet with a canonical (minimal) remaining length.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        write_variable_int(&mut buf, self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read one framed packet from a byte source.
///
/// # Errors
///
/// Returns a framing error for malformed headers and propagates IO errors
/// (including `UnexpectedEof` when the stream ends mid-packet).
pub async fn read_packet<R>(reader: &mut R) -> MqttResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    let packet_type = PacketType::from_u8(first >> 4)?;
    let flags = first & 0x0F;

    let mut remaining_length: u32 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = reader.read_u8().await?;
        remaining_length |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(MqttError::MalformedRemainingLength);
        }
    }

    let mut payload = vec![0u8; remaining_length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Packet {
        packet_type,
        flags,
        payload: Bytes::from(payload),
    })
}

/// Append a variable-byte integer.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encoded size of a variable-byte integer.
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
