//! Packet struct and whole-frame encoding.
//!
//! Represents one complete protocol message: a type and its payload.
//! Uses `bytes::Bytes` so decoded payloads can be handed around without copies.
//!
//! # Example
//!
//! ```
//! use doorbell_link::protocol::{encode_packet, decode_packet, PacketType};
//!
//! let wire = encode_packet(PacketType::Identity, &[1, 2, 3, 4, 5, 6]).unwrap();
//! assert_eq!(&wire[..5], &[0, 0, 0, 6, 1]);
//!
//! let packet = decode_packet(&wire).unwrap();
//! assert_eq!(packet.packet_type, PacketType::Identity);
//! assert_eq!(packet.payload(), &[1, 2, 3, 4, 5, 6]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{Header, PacketType, HEADER_SIZE};
use crate::error::{DoorbellError, Result};

/// A complete protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type from the header.
    pub packet_type: PacketType,
    /// Payload bytes (header excluded).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet.
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// Create a packet with no payload.
    pub fn empty(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            payload: Bytes::new(),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length (what goes into the length prefix).
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Build the header for this packet.
    ///
    /// Fails with [`DoorbellError::PayloadTooLarge`] if the payload does not
    /// fit in the 32-bit length prefix.
    pub fn header(&self) -> Result<Header> {
        let length = u32::try_from(self.payload.len())
            .map_err(|_| DoorbellError::PayloadTooLarge(self.payload.len()))?;
        Ok(Header::new(self.packet_type, length))
    }

    /// Encode the full frame (`header || payload`) as one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.header()?;
        let mut buf = BytesMut::with_capacity(header.frame_len());
        buf.put_slice(&header.encode());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Encode a typed payload into wire format.
///
/// Produces `header(5 bytes) || payload`. An empty payload yields exactly
/// the 5 header bytes with a zero length.
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>> {
    let length =
        u32::try_from(payload.len()).map_err(|_| DoorbellError::PayloadTooLarge(payload.len()))?;
    let header = Header::new(packet_type, length);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one packet from a contiguous buffer.
///
/// Bytes after the declared payload are ignored. Use
/// [`FrameAssembler`](super::FrameAssembler) for streamed input.
pub fn decode_packet(buf: &[u8]) -> Result<Packet> {
    let header = Header::decode(buf)?;
    let body = &buf[HEADER_SIZE..];
    let declared = header.payload_length as usize;
    if body.len() < declared {
        return Err(DoorbellError::Truncated {
            declared: header.payload_length,
            available: body.len(),
        });
    }
    Ok(Packet::new(
        header.packet_type,
        Bytes::copy_from_slice(&body[..declared]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_identity_matches_wire_layout() {
        let mac = [0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56];
        let wire = encode_packet(PacketType::Identity, &mac).unwrap();

        assert_eq!(
            wire,
            vec![0x00, 0x00, 0x00, 0x06, 0x01, 0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]
        );
    }

    #[test]
    fn test_encode_empty_payload_is_header_only() {
        let wire = encode_packet(PacketType::BellPressed, &[]).unwrap();
        assert_eq!(wire, vec![0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_packet_encode_matches_free_function() {
        let packet = Packet::new(PacketType::Image, Bytes::from_static(b"jpeg bytes"));
        let encoded = packet.encode().unwrap();
        let expected = encode_packet(PacketType::Image, b"jpeg bytes").unwrap();
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_decode_roundtrip_for_all_types() {
        let payload = b"payload";
        for byte in 0..=u8::MAX {
            let packet_type = PacketType::from_byte(byte);
            assert_eq!(packet_type.is_known(), byte <= 9);
            assert_eq!(packet_type.as_byte(), byte);
            let wire = encode_packet(packet_type, payload).unwrap();
            let packet = decode_packet(&wire).unwrap();
            assert_eq!(packet.packet_type, packet_type);
            assert_eq!(packet.payload(), payload);
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut wire = encode_packet(PacketType::Image, b"abcdef").unwrap();
        wire.truncate(wire.len() - 2);

        let result = decode_packet(&wire);
        assert!(matches!(
            result,
            Err(DoorbellError::Truncated {
                declared: 6,
                available: 4
            })
        ));
    }

    #[test]
    fn test_decode_short_header() {
        assert!(matches!(
            decode_packet(&[0, 0, 0]),
            Err(DoorbellError::MalformedHeader(3))
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let packet = decode_packet(&[0, 0, 0, 1, 99, 0xFF]).unwrap();
        assert_eq!(packet.packet_type, PacketType::from_byte(99));
        assert!(!packet.packet_type.is_known());
        assert_eq!(packet.packet_type.to_string(), "Unknown(99)");
        assert_eq!(packet.payload(), &[0xFF]);
    }

    #[test]
    fn test_header_reports_payload_length() {
        let packet = Packet::new(PacketType::Username, Bytes::from_static(b"alice\x01"));
        let header = packet.header().unwrap();
        assert_eq!(header.payload_length, 6);
        assert_eq!(packet.len(), 6);
        assert!(!packet.is_empty());
        assert!(Packet::empty(PacketType::StopStream).is_empty());
    }
}
