//! Typed payload layouts for the handshake packets.
//!
//! ```text
//! Identity     : [6 bytes MAC]
//! Config       : [flags u8][bell ms u32 BE][motion ms u32 BE][relay ms u32 BE]
//! Username     : [UTF-8 name][relay byte]?        (device -> gateway)
//! Username ack : [flags u8]                       (gateway -> device)
//! ```
//!
//! Durations in Config are milliseconds. Flag bit 0 of Config means
//! "registration required"; bit 0 of the Username ack means "accepted".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::{Packet, PacketType};
use crate::error::{DoorbellError, Result};

/// Size of a hardware address.
pub const MAC_SIZE: usize = 6;

/// Minimum Config payload size.
pub const CONFIG_PAYLOAD_SIZE: usize = 13;

/// Minimum Username ack payload size.
pub const USERNAME_ACK_SIZE: usize = 1;

const REGISTRATION_REQUIRED: u8 = 0b0000_0001;
const ACCEPTED: u8 = 0b0000_0001;

fn malformed(packet_type: PacketType, reason: String) -> DoorbellError {
    DoorbellError::MalformedPayload {
        packet_type,
        reason,
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Hardware address sent in the Identity packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; MAC_SIZE]);

impl MacAddress {
    /// Raw address bytes.
    pub fn octets(&self) -> [u8; MAC_SIZE] {
        self.0
    }

    /// Build the Identity packet carrying this address.
    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketType::Identity, Bytes::copy_from_slice(&self.0))
    }

    /// Parse an Identity payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() != MAC_SIZE {
            return Err(malformed(
                PacketType::Identity,
                format!("need {MAC_SIZE} bytes, got {}", payload.len()),
            ));
        }
        let mut octets = [0u8; MAC_SIZE];
        octets.copy_from_slice(payload);
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = DoorbellError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DoorbellError::Config(format!("invalid MAC address: {s:?}"));
        let mut octets = [0u8; MAC_SIZE];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

/// How long to keep capturing after a bell press or motion event.
///
/// A zero duration on the wire means a single frame, which is tracked as a
/// one-shot flag rather than a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureWindow {
    #[default]
    SingleFrame,
    For(Duration),
}

impl CaptureWindow {
    /// Interpret a millisecond count from the Config payload.
    pub fn from_millis(millis: u32) -> Self {
        if millis == 0 {
            CaptureWindow::SingleFrame
        } else {
            CaptureWindow::For(Duration::from_millis(u64::from(millis)))
        }
    }

    /// Keep the longer of two windows.
    pub fn max(self, other: CaptureWindow) -> CaptureWindow {
        match (self, other) {
            (CaptureWindow::For(a), CaptureWindow::For(b)) => CaptureWindow::For(a.max(b)),
            (CaptureWindow::For(a), CaptureWindow::SingleFrame)
            | (CaptureWindow::SingleFrame, CaptureWindow::For(a)) => CaptureWindow::For(a),
            (CaptureWindow::SingleFrame, CaptureWindow::SingleFrame) => {
                CaptureWindow::SingleFrame
            }
        }
    }
}

/// Configuration pushed by the gateway after it receives the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigPayload {
    /// Gateway does not know this device yet and wants a username.
    pub registration_required: bool,
    /// Capture window after a bell press.
    pub bell_capture: CaptureWindow,
    /// Capture window after motion is detected.
    pub motion_capture: CaptureWindow,
    /// How long the relay stays open after an OpenRelay packet.
    pub relay_open: Duration,
}

impl ConfigPayload {
    /// Parse a Config payload. Extra trailing bytes are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < CONFIG_PAYLOAD_SIZE {
            return Err(malformed(
                PacketType::Config,
                format!("need {CONFIG_PAYLOAD_SIZE} bytes, got {}", payload.len()),
            ));
        }
        Ok(Self {
            registration_required: payload[0] & REGISTRATION_REQUIRED != 0,
            bell_capture: CaptureWindow::from_millis(read_u32(&payload[1..5])),
            motion_capture: CaptureWindow::from_millis(read_u32(&payload[5..9])),
            relay_open: Duration::from_millis(u64::from(read_u32(&payload[9..13]))),
        })
    }

    /// Encode the payload (gateway side, used by tests and simulators).
    pub fn encode(&self) -> Bytes {
        fn millis(window: CaptureWindow) -> u32 {
            match window {
                CaptureWindow::SingleFrame => 0,
                CaptureWindow::For(d) => saturating_millis(d),
            }
        }

        let mut buf = BytesMut::with_capacity(CONFIG_PAYLOAD_SIZE);
        buf.put_u8(if self.registration_required {
            REGISTRATION_REQUIRED
        } else {
            0
        });
        buf.put_u32(millis(self.bell_capture));
        buf.put_u32(millis(self.motion_capture));
        buf.put_u32(saturating_millis(self.relay_open));
        buf.freeze()
    }

    /// Build the Config packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketType::Config, self.encode())
    }
}

fn saturating_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Registration request sent by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernamePayload {
    username: String,
    relay: Option<bool>,
}

impl UsernamePayload {
    /// Create a username payload; `relay` appends the relay-presence byte.
    pub fn new(username: impl Into<String>, relay: Option<bool>) -> Result<Self> {
        let username = username.into();
        if username.trim().is_empty() {
            return Err(DoorbellError::InvalidUsername(
                "username must not be empty".to_string(),
            ));
        }
        if username.contains('\0') {
            return Err(DoorbellError::InvalidUsername(
                "username must not contain NUL".to_string(),
            ));
        }
        Ok(Self { username, relay })
    }

    /// The username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Relay presence flag, if announced.
    pub fn relay(&self) -> Option<bool> {
        self.relay
    }

    /// Encode the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.username.len() + 1);
        buf.put_slice(self.username.as_bytes());
        if let Some(relay) = self.relay {
            buf.put_u8(u8::from(relay));
        }
        buf.freeze()
    }

    /// Parse a username payload (gateway side).
    ///
    /// The payload format cannot tell a trailing relay byte from the name, so
    /// the caller states whether one is expected.
    pub fn decode(payload: &[u8], has_relay_byte: bool) -> Result<Self> {
        let (name, relay) = match (has_relay_byte, payload.split_last()) {
            (true, Some((flag, name))) => (name, Some(*flag & 1 != 0)),
            (true, None) => {
                return Err(malformed(PacketType::Username, "empty payload".to_string()))
            }
            (false, _) => (payload, None),
        };
        let username = std::str::from_utf8(name)
            .map_err(|e| malformed(PacketType::Username, e.to_string()))?;
        Self::new(username, relay)
    }

    /// Build the Username packet.
    pub fn to_packet(&self) -> Packet {
        Packet::new(PacketType::Username, self.encode())
    }
}

/// Gateway answer to a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsernameAck {
    /// Username was accepted and the device is registered.
    pub accepted: bool,
}

impl UsernameAck {
    /// Parse an ack payload. Only bit 0 of the first byte is meaningful.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match payload.first() {
            Some(flags) => Ok(Self {
                accepted: flags & ACCEPTED != 0,
            }),
            None => Err(malformed(
                PacketType::Username,
                format!("need {USERNAME_ACK_SIZE} byte, got 0"),
            )),
        }
    }

    /// Build the ack packet (gateway side).
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::Username,
            Bytes::copy_from_slice(&[u8::from(self.accepted)]),
        )
    }
}
