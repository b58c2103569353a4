//! Control-plane framing
//!
//! ```text
//! ┌────────┬────────┬──────────────────┬─────────────────┐
//! │ type   │ flags  │ payload_size BE  │ payload ≤ 1024  │
//! │ 1 byte │ 1 byte │ 2 bytes          │                 │
//! └────────┴────────┴──────────────────┴─────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const CONTROL_HEADER_SIZE: usize = 4;
pub const MAX_CONTROL_PAYLOAD: usize = 1024;

/// Control message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Bang,
    VersionReq,
    VersionRsp,
    Input,
    SessionCtrl,
    Error,
    Unknown(u8),
}

impl From<u8> for ControlType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => ControlType::Bang,
            0x02 => ControlType::VersionReq,
            0x03 => ControlType::VersionRsp,
            0x04 => ControlType::Input,
            0x05 => ControlType::SessionCtrl,
            0xFF => ControlType::Error,
            other => ControlType::Unknown(other),
        }
    }
}

impl From<ControlType> for u8 {
    fn from(value: ControlType) -> Self {
        match value {
            ControlType::Bang => 0x01,
            ControlType::VersionReq => 0x02,
            ControlType::VersionRsp => 0x03,
            ControlType::Input => 0x04,
            ControlType::SessionCtrl => 0x05,
            ControlType::Error => 0xFF,
            ControlType::Unknown(other) => other,
        }
    }
}

/// One framed control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub msg_type: ControlType,
    pub flags: u8,
    pub payload: Bytes,
}

impl ControlMessage {
    pub fn new(msg_type: ControlType, payload: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            msg_type,
            flags: 0,
            payload,
        })
    }

    /// Keepalive carrying a 4-byte millisecond timestamp
    pub fn bang(timestamp_ms: u32) -> Self {
        Self {
            msg_type: ControlType::Bang,
            flags: 0,
            payload: Bytes::copy_from_slice(&timestamp_ms.to_be_bytes()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.msg_type.into());
        buf.put_u8(self.flags);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Take one complete message off the front of `buf`, if present
    pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < CONTROL_HEADER_SIZE {
            return Ok(None);
        }
        let size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if size > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(size));
        }
        if buf.len() < CONTROL_HEADER_SIZE + size {
            return Ok(None);
        }

        let msg_type = ControlType::from(buf.get_u8());
        let flags = buf.get_u8();
        buf.advance(2);
        let payload = buf.split_to(size).freeze();
        Ok(Some(Self {
            msg_type,
            flags,
            payload,
        }))
    }

    /// Payload as text, for VERSION_RSP and ERROR
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).trim_end_matches('\0').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bang_layout() {
        let encoded = ControlMessage::bang(0x0102_0304).encode();
        assert_eq!(&encoded[..], &[0x01, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let msg = ControlMessage::new(ControlType::VersionRsp, &b"1.2.3"[..]).unwrap();
        let encoded = msg.encode();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert_eq!(ControlMessage::try_decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[3..]);
        buf.extend_from_slice(&ControlMessage::bang(7).encode());

        let first = ControlMessage::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.text(), "1.2.3");
        let second = ControlMessage::try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.msg_type, ControlType::Bang);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_payload_limit() {
        assert!(ControlMessage::new(ControlType::Input, vec![0u8; MAX_CONTROL_PAYLOAD]).is_ok());
        assert!(matches!(
            ControlMessage::new(ControlType::Input, vec![0u8; MAX_CONTROL_PAYLOAD + 1]),
            Err(ProtocolError::PayloadTooLarge(_))
        ));

        let mut buf = BytesMut::from(&[0x04u8, 0x00, 0x04, 0x01][..]);
        assert!(ControlMessage::try_decode(&mut buf).is_err());
    }

    #[test]
    fn test_type_codes() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0xFF, 0x42] {
            assert_eq!(u8::from(ControlType::from(code)), code);
        }
        assert_eq!(ControlType::from(0xFF), ControlType::Error);
    }
}
