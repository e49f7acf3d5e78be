//! Transport layer for the gateway link.
//!
//! The core never touches sockets directly. It drives a [`Transport`], a
//! polling interface over one byte stream whose background I/O reports back
//! through discrete [`TransportEvent`]s:
//!
//! - [`TcpTransport`]: tokio `TcpStream` with a bounded send window
//! - [`MemoryTransport`]: in-process link driven by a [`MemoryPeer`]

mod link;
mod memory;
mod tcp;

pub use memory::{memory_pair, MemoryPeer, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport, DEFAULT_CONNECT_TIMEOUT};

pub(crate) use link::EventLink;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Event produced by a transport's background I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The stream is established.
    Connected,
    /// Bytes arrived from the gateway.
    DataReceived(Bytes),
    /// The peer acknowledged `n` sent bytes; send capacity was freed.
    SendCompleted(usize),
    /// The stream is gone.
    Closed,
}

/// Byte stream consumed by the connection core.
///
/// All calls are made by the single task that owns the connection. Queries
/// first apply whatever events the background I/O has produced, so the
/// answers reflect the latest known state without blocking.
#[async_trait]
pub trait Transport: Send {
    /// Open the stream. Replaces any previous stream.
    async fn connect(&mut self, host: &str, port: u16) -> Result<()>;

    /// Bytes received and not yet read.
    fn available_bytes(&mut self) -> usize;

    /// Read up to `max` received bytes.
    fn read_bytes(&mut self, max: usize) -> Bytes;

    /// Bytes the transport can accept right now.
    fn send_capacity(&mut self) -> usize;

    /// Hand bytes to the transport. Returns how many were accepted.
    fn try_send(&mut self, data: &[u8]) -> usize;

    /// Check if the stream is closed (or was never opened).
    fn is_closed(&mut self) -> bool;

    /// Close the stream and drop any buffered data.
    fn close(&mut self);

    /// Wait for the next event and apply it.
    ///
    /// Returns `None` once no further events can arrive.
    async fn wait_event(&mut self) -> Option<TransportEvent>;

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str;
}
