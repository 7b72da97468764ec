//! WireGuard UDP frame formats
//!
//! - type 1: handshake initiation, 148 bytes
//! - type 2: handshake response, 92 bytes
//! - type 3: cookie reply, 64 bytes
//! - type 4: transport data, 16-byte header plus ciphertext
//!
//! The 32-bit type field is little-endian on the wire; the three bytes
//! after the type byte are reserved zeros.

use crate::error::ProtocolError;

/// Handshake initiation (148 bytes)
///
/// ```text
/// type(4, le) | sender(4) | ephemeral(32) | static(32+16) |
/// timestamp(12+16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct Initiation {
    pub sender: u32,
    pub ephemeral: [u8; 32],
    pub sealed_static: [u8; 48],
    pub sealed_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Initiation {
    pub const SIZE: usize = 148;

    /// Bytes covered by mac1 (everything before the mac1 field).
    pub const MAC1_OFFSET: usize = 116;

    /// Bytes covered by mac2 (everything before the mac2 field).
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.sealed_static);
        buf[88..116].copy_from_slice(&self.sealed_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != 1 {
            return Err(ProtocolError::InvalidMessageType { mtcode: data[0] });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            ephemeral: data[8..40].try_into().unwrap(),
            sealed_static: data[40..88].try_into().unwrap(),
            sealed_timestamp: data[88..116].try_into().unwrap(),
            mac1: data[116..132].try_into().unwrap(),
            mac2: data[132..148].try_into().unwrap(),
        })
    }
}

/// Handshake response (92 bytes)
///
/// ```text
/// type(4, le) | sender(4) | receiver(4) | ephemeral(32) |
/// empty(0+16) | mac1(16) | mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; 32],
    pub sealed_empty: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Response {
    pub const SIZE: usize = 92;

    /// Bytes covered by mac1.
    pub const MAC1_OFFSET: usize = 60;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&2u32.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.sealed_empty);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != 2 {
            return Err(ProtocolError::InvalidMessageType { mtcode: data[0] });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            receiver: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            ephemeral: data[12..44].try_into().unwrap(),
            sealed_empty: data[44..60].try_into().unwrap(),
            mac1: data[60..76].try_into().unwrap(),
            mac2: data[76..92].try_into().unwrap(),
        })
    }
}

/// Cookie reply (64 bytes)
///
/// ```text
/// type(4, le) | receiver(4) | nonce(24) | cookie(16+16)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver: u32,
    pub nonce: [u8; 24],
    pub sealed_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&3u32.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.sealed_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != 3 {
            return Err(ProtocolError::InvalidMessageType { mtcode: data[0] });
        }
        Ok(Self {
            receiver: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nonce: data[8..32].try_into().unwrap(),
            sealed_cookie: data[32..64].try_into().unwrap(),
        })
    }
}

/// Transport data header (16 bytes, followed by the sealed packet)
///
/// ```text
/// type(4, le) | receiver(4) | counter(8, le) | packet(n+16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    pub receiver: u32,
    pub counter: u64,
}

impl DataHeader {
    pub const SIZE: usize = 16;

    /// Header plus the tag of an empty (keepalive) packet.
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Assemble a complete transport message around a sealed payload.
    pub fn frame(receiver: u32, counter: u64, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + sealed.len());
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&receiver.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(sealed);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != 4 {
            return Err(ProtocolError::InvalidMessageType { mtcode: data[0] });
        }
        Ok(Self {
            receiver: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            counter: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }

    /// The sealed payload of a transport message.
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_roundtrip() {
        let init = Initiation {
            sender: 0x12345678,
            ephemeral: [1u8; 32],
            sealed_static: [2u8; 48],
            sealed_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };
        let bytes = init.to_bytes();
        assert_eq!(bytes.len(), Initiation::SIZE);
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);

        let parsed = Initiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender, init.sender);
        assert_eq!(parsed.ephemeral, init.ephemeral);
        assert_eq!(parsed.mac1, init.mac1);
        assert_eq!(parsed.mac2, init.mac2);
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response {
            sender: 0x11223344,
            receiver: 0x55667788,
            ephemeral: [7u8; 32],
            sealed_empty: [8u8; 16],
            mac1: [9u8; 16],
            mac2: [0u8; 16],
        };
        let parsed = Response::from_bytes(&resp.to_bytes()).unwrap();
        assert_eq!(parsed.sender, resp.sender);
        assert_eq!(parsed.receiver, resp.receiver);
        assert_eq!(parsed.sealed_empty, resp.sealed_empty);
    }

    #[test]
    fn cookie_reply_roundtrip() {
        let cook = CookieReply {
            receiver: 0xdeadbeef,
            nonce: [6u8; 24],
            sealed_cookie: [7u8; 32],
        };
        let parsed = CookieReply::from_bytes(&cook.to_bytes()).unwrap();
        assert_eq!(parsed.receiver, cook.receiver);
        assert_eq!(parsed.nonce, cook.nonce);
    }

    #[test]
    fn data_frame_and_parse() {
        let sealed = vec![0xAA; 100];
        let msg = DataHeader::frame(42, 1234, &sealed);
        assert_eq!(msg[0], 4);
        assert_eq!(msg.len(), DataHeader::SIZE + sealed.len());

        let hdr = DataHeader::from_bytes(&msg).unwrap();
        assert_eq!(hdr.receiver, 42);
        assert_eq!(hdr.counter, 1234);
        assert_eq!(DataHeader::payload(&msg), &sealed[..]);
    }

    #[test]
    fn wrong_type_byte_is_rejected() {
        let mut bytes = Initiation {
            sender: 1,
            ephemeral: [0u8; 32],
            sealed_static: [0u8; 48],
            sealed_timestamp: [0u8; 28],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
        .to_bytes();
        bytes[0] = 2;
        assert!(Initiation::from_bytes(&bytes).is_err());
    }
}
