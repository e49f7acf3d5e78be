//! Wire format encoding and decoding.
//!
//! Implements the 5-byte header format:
//! ```text
//! ┌──────────────┬───────┬───────────────────┐
//! │ Length       │ Type  │ Payload           │
//! │ 4 bytes      │ 1 byte│ `Length` bytes    │
//! │ uint32 BE    │       │                   │
//! └──────────────┴───────┴───────────────────┘
//! ```
//!
//! The length prefix counts payload bytes only, never the header itself.

use std::fmt;

use crate::error::{DoorbellError, Result};

/// Header size in bytes (fixed, exactly 5).
pub const HEADER_SIZE: usize = 5;

/// Default maximum inbound payload size (1 MiB).
///
/// Frames declaring more than this are skipped by the assembler.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Packet type carried in the fifth header byte.
///
/// Byte values are shared with the gateway and must stay stable.
/// Unrecognised bytes survive decoding as [`PacketType::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Invalid,
    /// Device hardware address (gateway may also send it to request one).
    Identity,
    Config,
    /// Username from the device, or the registration ack from the gateway.
    Username,
    StartStream,
    StopStream,
    Image,
    BellPressed,
    MotionDetected,
    OpenRelay,
    /// A byte outside the known range, kept as received.
    Unknown(UnknownType),
}

/// Type byte with no known meaning.
///
/// Only produced by [`PacketType::from_byte`], so it never holds a byte
/// that belongs to a known type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnknownType(u8);

impl UnknownType {
    /// The raw wire byte.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for UnknownType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketType {
    /// Decode a type byte. Never fails.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => PacketType::Invalid,
            1 => PacketType::Identity,
            2 => PacketType::Config,
            3 => PacketType::Username,
            4 => PacketType::StartStream,
            5 => PacketType::StopStream,
            6 => PacketType::Image,
            7 => PacketType::BellPressed,
            8 => PacketType::MotionDetected,
            9 => PacketType::OpenRelay,
            other => PacketType::Unknown(UnknownType(other)),
        }
    }

    /// Wire byte for this type.
    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Invalid => 0,
            PacketType::Identity => 1,
            PacketType::Config => 2,
            PacketType::Username => 3,
            PacketType::StartStream => 4,
            PacketType::StopStream => 5,
            PacketType::Image => 6,
            PacketType::BellPressed => 7,
            PacketType::MotionDetected => 8,
            PacketType::OpenRelay => 9,
            PacketType::Unknown(unknown) => unknown.value(),
        }
    }

    /// Check if this is a type the protocol knows about.
    #[inline]
    pub fn is_known(self) -> bool {
        !matches!(self, PacketType::Unknown(_))
    }
}

impl From<u8> for PacketType {
    fn from(byte: u8) -> Self {
        PacketType::from_byte(byte)
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type.as_byte()
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Unknown(unknown) => write!(f, "Unknown({})", unknown.value()),
            known => write!(f, "{known:?}"),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared packet type.
    pub packet_type: PacketType,
    /// Payload length in bytes (header excluded).
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(packet_type: PacketType, payload_length: u32) -> Self {
        Self {
            packet_type,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian length, then type byte).
    ///
    /// # Example
    ///
    /// ```
    /// use doorbell_link::protocol::{Header, PacketType};
    ///
    /// let bytes = Header::new(PacketType::Identity, 6).encode();
    /// assert_eq!(bytes, [0, 0, 0, 6, 1]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (5 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[4] = self.packet_type.as_byte();
    }

    /// Decode header from bytes.
    ///
    /// Bytes past the first five are ignored. Fails with
    /// [`DoorbellError::MalformedHeader`] only if fewer than 5 bytes are given.
    ///
    /// # Example
    ///
    /// ```
    /// use doorbell_link::protocol::{Header, PacketType};
    ///
    /// let header = Header::decode(&[0, 0, 1, 0, 6]).unwrap();
    /// assert_eq!(header.packet_type, PacketType::Image);
    /// assert_eq!(header.payload_length, 256);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(DoorbellError::MalformedHeader(buf.len()));
        }
        Ok(Self {
            payload_length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            packet_type: PacketType::from_byte(buf[4]),
        })
    }

    /// Total frame size on the wire (header + payload).
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    Header::decode(buf)
}

/// Encode a header to bytes (standalone function).
#[inline]
pub fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
    header.encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(PacketType::OpenRelay, 0x0102_0304);
        let bytes = header.encode();

        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 9]);
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(PacketType::Image, 12_345);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let result = Header::decode(&[0u8; 4]);
        assert!(matches!(result, Err(DoorbellError::MalformedHeader(4))));

        let result = decode_header(&[]);
        assert!(matches!(result, Err(DoorbellError::MalformedHeader(0))));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let header = decode_header(&[0, 0, 0, 2, 4, 0xAA, 0xBB]).unwrap();
        assert_eq!(header.packet_type, PacketType::StartStream);
        assert_eq!(header.payload_length, 2);
    }

    #[test]
    fn test_packet_type_wire_values_are_stable() {
        let expected = [
            (PacketType::Invalid, 0),
            (PacketType::Identity, 1),
            (PacketType::Config, 2),
            (PacketType::Username, 3),
            (PacketType::StartStream, 4),
            (PacketType::StopStream, 5),
            (PacketType::Image, 6),
            (PacketType::BellPressed, 7),
            (PacketType::MotionDetected, 8),
            (PacketType::OpenRelay, 9),
        ];
        for (packet_type, byte) in expected {
            assert_eq!(packet_type.as_byte(), byte);
            assert_eq!(PacketType::from_byte(byte), packet_type);
        }
    }

    #[test]
    fn test_unknown_type_byte() {
        let packet_type = PacketType::from_byte(99);
        assert!(matches!(packet_type, PacketType::Unknown(u) if u.value() == 99));
        assert_eq!(packet_type.to_string(), "Unknown(99)");
        assert_eq!(packet_type.as_byte(), 99);
        assert!(!packet_type.is_known());
    }

    #[test]
    fn test_every_byte_survives_decoding() {
        for byte in 0..=u8::MAX {
            assert_eq!(PacketType::from_byte(byte).as_byte(), byte);
        }
    }

    #[test]
    fn test_known_type_display() {
        assert_eq!(PacketType::Identity.to_string(), "Identity");
        assert_eq!(PacketType::MotionDetected.to_string(), "MotionDetected");
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(Header::new(PacketType::BellPressed, 0).frame_len(), HEADER_SIZE);
        assert_eq!(Header::new(PacketType::Image, 10).frame_len(), HEADER_SIZE + 10);
    }
}
