//! Takion wire format
//!
//! ```text
//! offset 0      packet_type   u8   (CONTROL = 0)
//! offset 1..17  header
//!               +0  tag           u32
//!               +4  gmac          [u8; 4]
//!               +8  key_pos       u32
//!               +12 chunk_type    u8
//!               +13 chunk_flags   u8
//!               +14 payload_size  u16  (exact payload bytes)
//! offset 17..   payload
//! ```
//!
//! All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the chunk header following the packet type byte
pub const HEADER_SIZE: usize = 16;
/// Packet type byte plus header
pub const MESSAGE_OVERHEAD: usize = 1 + HEADER_SIZE;
/// INIT / INIT-ACK fixed prefix
pub const INIT_PAYLOAD_SIZE: usize = 16;
pub const COOKIE_SIZE: usize = 32;
pub const INIT_ACK_PAYLOAD_SIZE: usize = INIT_PAYLOAD_SIZE + COOKIE_SIZE;
/// Complete INIT datagram
pub const INIT_PACKET_SIZE: usize = MESSAGE_OVERHEAD + INIT_PAYLOAD_SIZE;
/// Chunk flag marking a DATA chunk as a disconnect notice
pub const FLAG_DISCONNECT: u8 = 0x01;

/// First byte of every Takion datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Control,
    Video,
    Audio,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0 => PacketType::Control,
            2 => PacketType::Video,
            3 => PacketType::Audio,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Control => 0,
            PacketType::Video => 2,
            PacketType::Audio => 3,
            PacketType::Unknown(other) => other,
        }
    }
}

/// Chunk type carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Data,
    Init,
    InitAck,
    Cookie,
    CookieAck,
    FeedbackState,
    FeedbackHistory,
    Unknown(u8),
}

impl From<u8> for ChunkType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ChunkType::Data,
            0x01 => ChunkType::Init,
            0x02 => ChunkType::InitAck,
            0x0A => ChunkType::Cookie,
            0x0B => ChunkType::CookieAck,
            0x8E => ChunkType::FeedbackState,
            0x8F => ChunkType::FeedbackHistory,
            other => ChunkType::Unknown(other),
        }
    }
}

impl From<ChunkType> for u8 {
    fn from(value: ChunkType) -> Self {
        match value {
            ChunkType::Data => 0x00,
            ChunkType::Init => 0x01,
            ChunkType::InitAck => 0x02,
            ChunkType::Cookie => 0x0A,
            ChunkType::CookieAck => 0x0B,
            ChunkType::FeedbackState => 0x8E,
            ChunkType::FeedbackHistory => 0x8F,
            ChunkType::Unknown(other) => other,
        }
    }
}

/// The 16-byte chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub tag: u32,
    pub gmac: [u8; 4],
    pub key_pos: u32,
    pub chunk_type: ChunkType,
    pub chunk_flags: u8,
    pub payload_size: u16,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tag);
        buf.put_slice(&self.gmac);
        buf.put_u32(self.key_pos);
        buf.put_u8(self.chunk_type.into());
        buf.put_u8(self.chunk_flags);
        buf.put_u16(self.payload_size);
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated(buf.len()));
        }
        let tag = buf.get_u32();
        let mut gmac = [0u8; 4];
        buf.copy_to_slice(&mut gmac);
        Ok(Self {
            tag,
            gmac,
            key_pos: buf.get_u32(),
            chunk_type: ChunkType::from(buf.get_u8()),
            chunk_flags: buf.get_u8(),
            payload_size: buf.get_u16(),
        })
    }
}

/// A complete control datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakionMessage {
    pub packet_type: PacketType,
    pub tag: u32,
    pub gmac: [u8; 4],
    pub key_pos: u32,
    pub chunk_type: ChunkType,
    pub chunk_flags: u8,
    pub payload: Bytes,
}

impl TakionMessage {
    /// Control message with a zero MAC
    pub fn control(chunk_type: ChunkType, tag: u32, key_pos: u32, payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Control,
            tag,
            gmac: [0; 4],
            key_pos,
            chunk_type,
            chunk_flags: 0,
            payload,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.chunk_flags = flags;
        self
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            tag: self.tag,
            gmac: self.gmac,
            key_pos: self.key_pos,
            chunk_type: self.chunk_type,
            chunk_flags: self.chunk_flags,
            payload_size: self.payload.len() as u16,
        }
    }

    pub fn encoded_len(&self) -> usize {
        MESSAGE_OVERHEAD + self.payload.len()
    }

    /// Serialize into a datagram
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.payload.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.packet_type.into());
        self.header().encode(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a datagram whose length must match the header exactly
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < MESSAGE_OVERHEAD {
            return Err(ProtocolError::Truncated(datagram.len()));
        }
        let header = MessageHeader::decode(&datagram[1..MESSAGE_OVERHEAD])?;
        let expected = MESSAGE_OVERHEAD + header.payload_size as usize;
        if datagram.len() != expected {
            return Err(ProtocolError::LengthMismatch {
                expected,
                actual: datagram.len(),
            });
        }
        Ok(Self {
            packet_type: PacketType::from(datagram[0]),
            tag: header.tag,
            gmac: header.gmac,
            key_pos: header.key_pos,
            chunk_type: header.chunk_type,
            chunk_flags: header.chunk_flags,
            payload: Bytes::copy_from_slice(&datagram[MESSAGE_OVERHEAD..]),
        })
    }

    /// Parse and require a control datagram of the given chunk type
    pub fn decode_expecting(datagram: &[u8], chunk_type: ChunkType) -> Result<Self, ProtocolError> {
        let msg = Self::decode(datagram)?;
        if msg.packet_type != PacketType::Control {
            return Err(ProtocolError::UnexpectedPacketType(msg.packet_type.into()));
        }
        if msg.chunk_type != chunk_type {
            return Err(ProtocolError::UnexpectedChunk {
                expected: chunk_type.into(),
                actual: msg.chunk_type.into(),
            });
        }
        Ok(msg)
    }
}

/// INIT chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitChunk {
    pub tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_seq: u32,
}

impl InitChunk {
    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tag);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.outbound_streams);
        buf.put_u16(self.inbound_streams);
        buf.put_u32(self.initial_seq);
    }

    fn get(buf: &mut impl Buf) -> Self {
        Self {
            tag: buf.get_u32(),
            a_rwnd: buf.get_u32(),
            outbound_streams: buf.get_u16(),
            inbound_streams: buf.get_u16(),
            initial_seq: buf.get_u32(),
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INIT_PAYLOAD_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != INIT_PAYLOAD_SIZE {
            return Err(ProtocolError::LengthMismatch {
                expected: INIT_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }
        let mut buf = payload;
        Ok(Self::get(&mut buf))
    }

    /// The complete INIT datagram; the header tag is zero before association
    pub fn to_message(&self) -> TakionMessage {
        TakionMessage::control(ChunkType::Init, 0, 0, self.to_payload())
    }

    /// Parse a complete INIT datagram, which is exactly 33 bytes
    pub fn parse_packet(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() != INIT_PACKET_SIZE {
            return Err(ProtocolError::LengthMismatch {
                expected: INIT_PACKET_SIZE,
                actual: datagram.len(),
            });
        }
        let msg = TakionMessage::decode_expecting(datagram, ChunkType::Init)?;
        Self::from_payload(&msg.payload)
    }
}

/// INIT-ACK chunk payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitAckChunk {
    pub tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_seq: u32,
    pub cookie: [u8; COOKIE_SIZE],
}

impl InitAckChunk {
    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INIT_ACK_PAYLOAD_SIZE);
        InitChunk {
            tag: self.tag,
            a_rwnd: self.a_rwnd,
            outbound_streams: self.outbound_streams,
            inbound_streams: self.inbound_streams,
            initial_seq: self.initial_seq,
        }
        .put(&mut buf);
        buf.put_slice(&self.cookie);
        buf.freeze()
    }

    /// Parse the payload; anything shorter than prefix plus cookie is rejected
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < INIT_ACK_PAYLOAD_SIZE {
            return Err(ProtocolError::Truncated(payload.len()));
        }
        let mut buf = payload;
        let prefix = InitChunk::get(&mut buf);
        let mut cookie = [0u8; COOKIE_SIZE];
        buf.copy_to_slice(&mut cookie);
        if prefix.tag == 0 {
            return Err(ProtocolError::ZeroTag);
        }
        Ok(Self {
            tag: prefix.tag,
            a_rwnd: prefix.a_rwnd,
            outbound_streams: prefix.outbound_streams,
            inbound_streams: prefix.inbound_streams,
            initial_seq: prefix.initial_seq,
            cookie,
        })
    }

    pub fn to_message(&self, header_tag: u32) -> TakionMessage {
        TakionMessage::control(ChunkType::InitAck, header_tag, 0, self.to_payload())
    }
}

/// COOKIE chunk: the INIT-ACK cookie echoed back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieChunk {
    pub cookie: [u8; COOKIE_SIZE],
}

impl CookieChunk {
    pub fn to_message(&self, remote_tag: u32) -> TakionMessage {
        TakionMessage::control(ChunkType::Cookie, remote_tag, 0, Bytes::copy_from_slice(&self.cookie))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        let cookie: [u8; COOKIE_SIZE] = payload.try_into().map_err(|_| ProtocolError::LengthMismatch {
            expected: COOKIE_SIZE,
            actual: payload.len(),
        })?;
        Ok(Self { cookie })
    }
}

/// Coarse content class of a DATA payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Video,
    Audio,
    /// Protobuf or other control content
    Control,
}

/// H.264 Annex B start code
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Classify a DATA payload by its first four bytes
pub fn classify_payload(payload: &[u8]) -> DataKind {
    if payload.len() >= 4 && payload[..4] == START_CODE {
        DataKind::Video
    } else {
        DataKind::Control
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_init() -> InitChunk {
        InitChunk {
            tag: 0xDEAD_BEEF,
            a_rwnd: 102_400,
            outbound_streams: 100,
            inbound_streams: 100,
            initial_seq: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_init_is_33_bytes() {
        let bytes = sample_init().to_message().encode().unwrap();
        assert_eq!(bytes.len(), 33);
        assert_eq!(bytes[0], 0);
        // header tag zero before association
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
        assert_eq!(bytes[13], 0x01);
        assert_eq!(&bytes[15..17], &[0x00, 0x10]);
        assert_eq!(&bytes[17..21], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(InitChunk::parse_packet(&bytes).unwrap(), sample_init());
    }

    #[test]
    fn test_init_length_boundaries() {
        let bytes = sample_init().to_message().encode().unwrap();
        assert!(InitChunk::parse_packet(&bytes[..32]).is_err());
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(InitChunk::parse_packet(&longer).is_err());
    }

    #[test]
    fn test_header_big_endian() {
        let msg = TakionMessage::control(ChunkType::FeedbackState, 0x0102_0304, 0x0A0B_0C0D, Bytes::from_static(b"xy"));
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[9..13], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(bytes[13], 0x8E);
        assert_eq!(&bytes[15..17], &[0, 2]);
        assert_eq!(TakionMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_init_ack_requires_cookie() {
        let ack = InitAckChunk {
            tag: 0x1234_5678,
            a_rwnd: 65_536,
            outbound_streams: 10,
            inbound_streams: 10,
            initial_seq: 7,
            cookie: [0xAB; COOKIE_SIZE],
        };
        let payload = ack.to_payload();
        assert_eq!(payload.len(), 48);
        assert_eq!(InitAckChunk::from_payload(&payload).unwrap(), ack);
        assert!(matches!(
            InitAckChunk::from_payload(&payload[..47]),
            Err(ProtocolError::Truncated(47))
        ));

        let decoded = TakionMessage::decode(&ack.to_message(0).encode().unwrap()).unwrap();
        assert_eq!(decoded.chunk_type, ChunkType::InitAck);
    }

    #[test]
    fn test_init_ack_zero_tag_rejected() {
        let ack = InitAckChunk {
            tag: 0,
            a_rwnd: 0,
            outbound_streams: 0,
            inbound_streams: 0,
            initial_seq: 0,
            cookie: [0; COOKIE_SIZE],
        };
        assert_eq!(InitAckChunk::from_payload(&ack.to_payload()), Err(ProtocolError::ZeroTag));
    }

    #[test]
    fn test_cookie_and_cookie_ack() {
        let cookie = CookieChunk { cookie: [7; COOKIE_SIZE] };
        let bytes = cookie.to_message(99).encode().unwrap();
        let msg = TakionMessage::decode_expecting(&bytes, ChunkType::Cookie).unwrap();
        assert_eq!(msg.tag, 99);
        assert_eq!(CookieChunk::from_payload(&msg.payload).unwrap(), cookie);

        let ack = TakionMessage::control(ChunkType::CookieAck, 1, 0, Bytes::new());
        let bytes = ack.encode().unwrap();
        assert_eq!(bytes.len(), MESSAGE_OVERHEAD);
        assert_eq!(TakionMessage::decode(&bytes).unwrap(), ack);
    }

    #[test]
    fn test_wrong_chunk_rejected() {
        let bytes = CookieChunk { cookie: [0; 32] }.to_message(1).encode().unwrap();
        assert!(matches!(
            TakionMessage::decode_expecting(&bytes, ChunkType::CookieAck),
            Err(ProtocolError::UnexpectedChunk { expected: 0x0B, actual: 0x0A })
        ));
    }

    #[test]
    fn test_classify_payload() {
        assert_eq!(classify_payload(&[0, 0, 0, 1, 0x67]), DataKind::Video);
        assert_eq!(classify_payload(&[0x08, 0x01]), DataKind::Control);
        assert_eq!(classify_payload(&[]), DataKind::Control);
    }

    #[test]
    fn test_disconnect_encoding() {
        let msg = TakionMessage::control(ChunkType::Data, 42, 0, Bytes::new()).with_flags(FLAG_DISCONNECT);
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[13], 0x00);
        assert_eq!(bytes[14], 0x01);
    }
}
