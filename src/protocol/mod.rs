//! Protocol module - wire format, packet framing, and payload layouts.
//!
//! This module implements the binary protocol spoken with the gateway:
//! - 5-byte header encoding/decoding
//! - Frame assembler for packets split across transport reads
//! - Typed payloads for the handshake packets

mod frame_assembler;
mod packet;
mod payload;
mod wire_format;

pub use frame_assembler::FrameAssembler;
pub use packet::{decode_packet, encode_packet, Packet};
pub use payload::{
    CaptureWindow, ConfigPayload, MacAddress, UsernameAck, UsernamePayload, CONFIG_PAYLOAD_SIZE,
    MAC_SIZE, USERNAME_ACK_SIZE,
};
pub use wire_format::{
    decode_header, encode_header, Header, PacketType, UnknownType, DEFAULT_MAX_PAYLOAD_SIZE,
    HEADER_SIZE,
};
