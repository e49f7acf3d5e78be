//! TCP transport to the gateway.
//!
//! The stream is split into a reader task and a writer task. Both report
//! through the event channel; the owning connection only ever sees the
//! [`Transport`] polling interface. Outbound bytes are limited by a send
//! window sized like the device's network stack buffer, and window space is
//! returned once the writer task has flushed the bytes to the socket.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{EventLink, Transport, TransportEvent};
use crate::backpressure::DEFAULT_SEND_BUFFER_SIZE;
use crate::error::{DoorbellError, Result};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size of a single socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Bytes allowed in flight before `send_capacity` drops to zero.
    pub send_buffer_size: usize,
    /// Buffer size for each socket read.
    pub read_chunk_size: usize,
    /// Enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            nodelay: true,
        }
    }
}

/// TCP stream to the gateway.
pub struct TcpTransport {
    config: TcpConfig,
    link: EventLink,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
    remote_addr: Option<SocketAddr>,
}

impl TcpTransport {
    /// Create a disconnected transport.
    pub fn new(config: TcpConfig) -> Self {
        let link = EventLink::new(config.send_buffer_size);
        Self {
            config,
            link,
            outbound: None,
            tasks: Vec::new(),
            remote_addr: None,
        }
    }

    /// Remote address of the current stream.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn shutdown(&mut self) {
        self.outbound = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.link.reset();
        self.remote_addr = None;
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Gateway closed the stream");
                break;
            }
            Ok(n) => {
                trace!(bytes = n, "Received");
                let event = TransportEvent::DataReceived(Bytes::copy_from_slice(&buf[..n]));
                if events.send(event).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Read failed");
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Closed);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(error = %e, "Write failed");
            let _ = events.send(TransportEvent::Closed);
            return;
        }
        if events.send(TransportEvent::SendCompleted(data.len())).is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.shutdown();

        let stream = timeout(self.config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                DoorbellError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                ))
            })??;

        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        self.remote_addr = stream.peer_addr().ok();

        let (reader, writer) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let _ = event_tx.send(TransportEvent::Connected);
        self.tasks.push(tokio::spawn(read_loop(
            reader,
            event_tx.clone(),
            self.config.read_chunk_size,
        )));
        self.tasks
            .push(tokio::spawn(write_loop(writer, out_rx, event_tx)));

        self.link.attach(event_rx);
        self.outbound = Some(out_tx);

        debug!(host, port, remote = ?self.remote_addr, "TCP connected");
        Ok(())
    }

    fn available_bytes(&mut self) -> usize {
        self.link.available()
    }

    fn read_bytes(&mut self, max: usize) -> Bytes {
        self.link.take(max)
    }

    fn send_capacity(&mut self) -> usize {
        self.link.capacity()
    }

    fn try_send(&mut self, data: &[u8]) -> usize {
        if self.link.is_closed() {
            return 0;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return 0;
        };

        let accepted = self.link.reserve(data.len());
        if accepted == 0 {
            return 0;
        }
        if outbound
            .send(Bytes::copy_from_slice(&data[..accepted]))
            .is_err()
        {
            self.link.mark_closed();
            return 0;
        }
        accepted
    }

    fn is_closed(&mut self) -> bool {
        self.link.is_closed()
    }

    fn close(&mut self) {
        if self.outbound.is_some() {
            debug!(remote = ?self.remote_addr, "TCP closed");
        }
        self.shutdown();
    }

    async fn wait_event(&mut self) -> Option<TransportEvent> {
        self.link.next().await
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::default();
        assert!(transport.is_closed());
        transport.connect("127.0.0.1", port).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        assert!(!transport.is_closed());
        assert_eq!(transport.send_capacity(), DEFAULT_SEND_BUFFER_SIZE);
        assert_eq!(transport.try_send(b"ping"), 4);

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        while transport.available_bytes() < 4 {
            transport.wait_event().await.unwrap();
        }
        assert_eq!(&transport.read_bytes(16)[..], b"pong");
    }

    #[tokio::test]
    async fn test_send_window_limits_accepted_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::new(TcpConfig {
            send_buffer_size: 8,
            ..TcpConfig::default()
        });
        transport.connect("127.0.0.1", port).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        assert_eq!(transport.try_send(b"0123456789"), 8);

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        while transport.send_capacity() < 8 {
            transport.wait_event().await.unwrap();
        }
        assert_eq!(transport.try_send(b"89"), 2);
    }

    #[tokio::test]
    async fn test_peer_close_is_observed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut transport = TcpTransport::default();
        transport.connect("127.0.0.1", port).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        while !transport.is_closed() {
            if transport.wait_event().await.is_none() {
                break;
            }
        }
        assert!(transport.is_closed());
        assert_eq!(transport.send_capacity(), 0);
        assert_eq!(transport.try_send(b"late"), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::default();
        let result = transport.connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(DoorbellError::Io(_))));
        assert!(transport.is_closed());
    }
}
