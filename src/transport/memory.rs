//! In-process transport with a scriptable gateway peer.
//!
//! [`memory_pair`] returns the device-side [`MemoryTransport`] and a
//! [`MemoryPeer`] that plays the gateway: it pushes inbound bytes, reads what
//! the device wrote, acknowledges sent bytes, and can stall or refuse the
//! link on demand.
//!
//! # Example
//!
//! ```
//! use doorbell_link::protocol::{Packet, PacketType};
//! use doorbell_link::transport::{memory_pair, Transport};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let (mut transport, peer) = memory_pair(1024);
//! transport.connect("gateway", 2376).await.unwrap();
//!
//! peer.push_packet(&Packet::empty(PacketType::StartStream));
//! assert_eq!(transport.available_bytes(), 5);
//! # });
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{EventLink, Transport, TransportEvent};
use crate::error::{DoorbellError, Result};
use crate::protocol::{FrameAssembler, Packet};

#[derive(Debug)]
struct PeerState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    received: BytesMut,
    assembler: FrameAssembler,
    capacity_script: VecDeque<usize>,
    accept_script: VecDeque<usize>,
    read_script: VecDeque<usize>,
    last_endpoint: Option<(String, u16)>,
}

#[derive(Debug)]
struct Shared {
    accepting: AtomicBool,
    auto_ack: AtomicBool,
    connections: AtomicUsize,
    state: Mutex<PeerState>,
}

/// Create a connected-on-demand transport and its gateway peer.
///
/// `send_buffer_size` bounds unacknowledged device output; with auto-ack
/// (the default) every accepted byte is acknowledged immediately.
pub fn memory_pair(send_buffer_size: usize) -> (MemoryTransport, MemoryPeer) {
    let shared = Arc::new(Shared {
        accepting: AtomicBool::new(true),
        auto_ack: AtomicBool::new(true),
        connections: AtomicUsize::new(0),
        state: Mutex::new(PeerState {
            events: None,
            received: BytesMut::new(),
            assembler: FrameAssembler::new(),
            capacity_script: VecDeque::new(),
            accept_script: VecDeque::new(),
            read_script: VecDeque::new(),
            last_endpoint: None,
        }),
    });

    let transport = MemoryTransport {
        shared: shared.clone(),
        link: EventLink::new(send_buffer_size),
    };
    (transport, MemoryPeer { shared })
}

/// Device side of an in-process link.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    link: EventLink,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.close();

        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(DoorbellError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{host}:{port} refused the connection"),
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Connected);
        {
            let mut state = self.shared.state.lock();
            state.events = Some(tx);
            state.received.clear();
            state.assembler.reset();
            state.last_endpoint = Some((host.to_string(), port));
        }
        self.shared.connections.fetch_add(1, Ordering::AcqRel);
        self.link.attach(rx);

        debug!(host, port, "Memory link connected");
        Ok(())
    }

    fn available_bytes(&mut self) -> usize {
        self.link.available()
    }

    fn read_bytes(&mut self, max: usize) -> Bytes {
        let limit = self.shared.state.lock().read_script.pop_front();
        self.link.take(limit.map_or(max, |limit| max.min(limit)))
    }

    fn send_capacity(&mut self) -> usize {
        if self.link.is_closed() {
            return 0;
        }
        let scripted = self.shared.state.lock().capacity_script.pop_front();
        scripted.unwrap_or_else(|| self.link.capacity())
    }

    fn try_send(&mut self, data: &[u8]) -> usize {
        if self.link.is_closed() {
            return 0;
        }

        let mut state = self.shared.state.lock();
        let mut accepted = data.len();
        if let Some(limit) = state.accept_script.pop_front() {
            accepted = accepted.min(limit);
        }
        if !self.shared.auto_ack.load(Ordering::Acquire) {
            accepted = self.link.reserve(accepted);
        }
        state.received.extend_from_slice(&data[..accepted]);
        accepted
    }

    fn is_closed(&mut self) -> bool {
        self.link.is_closed()
    }

    fn close(&mut self) {
        self.shared.state.lock().events = None;
        self.link.reset();
    }

    async fn wait_event(&mut self) -> Option<TransportEvent> {
        self.link.next().await
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Gateway side of an in-process link.
///
/// Cheap to clone; every clone drives the same link.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<Shared>,
}

impl MemoryPeer {
    fn emit(&self, event: TransportEvent) -> bool {
        let state = self.shared.state.lock();
        match state.events.as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver bytes to the device. Returns `false` if no link is open.
    pub fn push(&self, data: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::DataReceived(data.into()))
    }

    /// Deliver bytes split into pieces of the given sizes (the last piece
    /// takes whatever is left).
    pub fn push_split(&self, data: &[u8], sizes: &[usize]) -> bool {
        let mut rest = data;
        for &size in sizes {
            let (piece, tail) = rest.split_at(size.min(rest.len()));
            if !piece.is_empty() && !self.push(Bytes::copy_from_slice(piece)) {
                return false;
            }
            rest = tail;
        }
        rest.is_empty() || self.push(Bytes::copy_from_slice(rest))
    }

    /// Encode and deliver a packet.
    pub fn push_packet(&self, packet: &Packet) -> bool {
        match packet.encode() {
            Ok(encoded) => self.push(encoded),
            Err(_) => false,
        }
    }

    /// Take every byte the device has written so far.
    pub fn take_output(&self) -> Bytes {
        self.shared.state.lock().received.split().freeze()
    }

    /// Take the packets the device has written so far.
    ///
    /// A trailing partial packet stays buffered for the next call.
    pub fn take_packets(&self) -> Vec<Packet> {
        let mut state = self.shared.state.lock();
        let output = state.received.split();
        state.assembler.feed(&output)
    }

    /// Acknowledge `n` bytes, freeing device send capacity (manual-ack mode).
    pub fn acknowledge(&self, n: usize) -> bool {
        self.emit(TransportEvent::SendCompleted(n))
    }

    /// Close the link from the gateway side.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::Closed);
        }
    }

    /// Refuse (or accept again) future connection attempts.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
    }

    /// Acknowledge device output immediately (`true`, default) or only
    /// through [`acknowledge`](Self::acknowledge).
    pub fn set_auto_ack(&self, auto_ack: bool) {
        self.shared.auto_ack.store(auto_ack, Ordering::Release);
    }

    /// Queue values returned by the next `send_capacity` calls.
    pub fn script_capacity(&self, capacities: impl IntoIterator<Item = usize>) {
        self.shared
            .state
            .lock()
            .capacity_script
            .extend(capacities);
    }

    /// Queue upper bounds for the bytes accepted by the next `try_send` calls.
    pub fn script_accepts(&self, accepts: impl IntoIterator<Item = usize>) {
        self.shared.state.lock().accept_script.extend(accepts);
    }

    /// Queue upper bounds for the bytes returned by the next `read_bytes`
    /// calls, regardless of what `available_bytes` reported.
    pub fn script_reads(&self, limits: impl IntoIterator<Item = usize>) {
        self.shared.state.lock().read_script.extend(limits);
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Whether the device currently holds an open link.
    pub fn is_connected(&self) -> bool {
        self.shared
            .state
            .lock()
            .events
            .as_ref()
            .is_some_and(|events| !events.is_closed())
    }

    /// Host and port of the most recent connect.
    pub fn last_endpoint(&self) -> Option<(String, u16)> {
        self.shared.state.lock().last_endpoint.clone()
    }
}
