//! Frame assembler for reassembling packets across arbitrary chunk boundaries.
//!
//! Implements a state machine for handling fragmented packets:
//! - `AwaitingHeader`: fewer than 5 header bytes seen so far
//! - `AwaitingPayload`: header parsed, payload buffer reserved, need N more bytes
//! - `Discarding`: header declared a payload above the limit, skip its bytes
//!
//! Unlike a socket buffer that accumulates everything, the assembler only
//! holds the partial header or the payload of the packet currently in flight.
//!
//! # Example
//!
//! ```
//! use doorbell_link::protocol::{encode_packet, FrameAssembler, PacketType};
//!
//! let wire = encode_packet(PacketType::StartStream, &[]).unwrap();
//! let mut assembler = FrameAssembler::new();
//!
//! assert!(assembler.feed(&wire[..3]).is_empty());
//! let packets = assembler.feed(&wire[3..]);
//! assert_eq!(packets[0].packet_type, PacketType::StartStream);
//! ```

use bytes::BytesMut;
use tracing::{debug, warn};

use super::wire_format::{Header, PacketType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Packet;

/// Payload bytes reserved when a header arrives; larger frames grow as
/// their bytes come in.
const INITIAL_PAYLOAD_RESERVE: usize = 64 * 1024;

/// Packet whose header has been observed but whose payload is incomplete.
#[derive(Debug)]
struct InFlightFrame {
    packet_type: PacketType,
    declared_length: usize,
    payload: BytesMut,
}

impl InFlightFrame {
    fn new(header: Header) -> Self {
        let declared_length = header.payload_length as usize;
        Self {
            packet_type: header.packet_type,
            declared_length,
            payload: BytesMut::with_capacity(declared_length.min(INITIAL_PAYLOAD_RESERVE)),
        }
    }

    fn missing(&self) -> usize {
        self.declared_length - self.payload.len()
    }
}

#[derive(Debug)]
enum State {
    /// Collecting header bytes.
    AwaitingHeader { buf: [u8; HEADER_SIZE], filled: usize },
    /// Header parsed, collecting payload bytes.
    AwaitingPayload(InFlightFrame),
    /// Skipping the payload of an oversize frame.
    Discarding { packet_type: PacketType, remaining: usize },
}

impl State {
    fn awaiting_header() -> Self {
        State::AwaitingHeader {
            buf: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Incremental packet decoder fed with raw transport chunks.
///
/// Never blocks and never fails: malformed framing (an oversize declared
/// length) is skipped so the stream stays in sync.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
    max_payload_size: u32,
    dropped_frames: u64,
}

impl FrameAssembler {
    /// Create an assembler with the default 1 MiB payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create an assembler with a custom payload limit.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            state: State::awaiting_header(),
            max_payload_size,
            dropped_frames: 0,
        }
    }

    /// Consume bytes from `chunk` until at most one packet completes.
    ///
    /// Returns the completed packet, if any, together with the unconsumed
    /// tail of the chunk.
    pub fn feed_one<'a>(&mut self, mut chunk: &'a [u8]) -> (Option<Packet>, &'a [u8]) {
        while !chunk.is_empty() {
            match &mut self.state {
                State::AwaitingHeader { buf, filled } => {
                    let take = (HEADER_SIZE - *filled).min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];

                    if *filled < HEADER_SIZE {
                        continue;
                    }

                    // Exactly HEADER_SIZE bytes are buffered here.
                    let Ok(header) = Header::decode(&buf[..]) else {
                        continue;
                    };

                    if header.payload_length > self.max_payload_size {
                        warn!(
                            packet_type = %header.packet_type,
                            declared = header.payload_length,
                            max = self.max_payload_size,
                            "Dropping oversize packet"
                        );
                        self.dropped_frames += 1;
                        self.state = State::Discarding {
                            packet_type: header.packet_type,
                            remaining: header.payload_length as usize,
                        };
                        continue;
                    }

                    if header.payload_length == 0 {
                        self.state = State::awaiting_header();
                        return (Some(Packet::empty(header.packet_type)), chunk);
                    }

                    self.state = State::AwaitingPayload(InFlightFrame::new(header));
                }

                State::AwaitingPayload(frame) => {
                    let take = frame.missing().min(chunk.len());
                    frame.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if frame.missing() == 0 {
                        let payload = std::mem::take(&mut frame.payload).freeze();
                        let packet = Packet::new(frame.packet_type, payload);
                        self.state = State::awaiting_header();
                        return (Some(packet), chunk);
                    }
                }

                State::Discarding {
                    packet_type,
                    remaining,
                } => {
                    let take = (*remaining).min(chunk.len());
                    *remaining -= take;
                    chunk = &chunk[take..];

                    if *remaining == 0 {
                        debug!(packet_type = %packet_type, "Oversize packet skipped");
                        self.state = State::awaiting_header();
                    }
                }
            }
        }

        (None, chunk)
    }

    /// Feed a whole chunk and collect every packet it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut rest = chunk;

        loop {
            let (packet, tail) = self.feed_one(rest);
            rest = tail;
            match packet {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }

        packets
    }

    /// Drop any partial header or in-flight payload.
    pub fn reset(&mut self) {
        self.state = State::awaiting_header();
    }

    /// Whether no packet is partially received.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingHeader { filled: 0, .. })
    }

    /// Number of oversize frames skipped since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Configured payload limit.
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::AwaitingHeader { .. } => "AwaitingHeader",
            State::AwaitingPayload(_) => "AwaitingPayload",
            State::Discarding { .. } => "Discarding",
        }
    }

    #[cfg(test)]
    fn reserved_payload(&self) -> usize {
        match &self.state {
            State::AwaitingPayload(frame) => frame.payload.capacity(),
            _ => 0,
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
