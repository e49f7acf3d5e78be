//! Connection manager and its builder.
//!
//! The [`ConnectionBuilder`] provides a fluent API for configuring the
//! gateway endpoint, link timings and session settings. The
//! [`ConnectionManager`] owns everything belonging to one connection:
//! 1. Connect with retries and send the identity
//! 2. On every `poll`, read available bytes and reassemble packets
//! 3. Dispatch packets to the session and write its responses
//! 4. Close (locally, on request from another task, or when the gateway
//!    drops the stream) and start over on the next `connect`
//!
//! # Example
//!
//! ```no_run
//! use doorbell_link::connection::ConnectionBuilder;
//! use doorbell_link::transport::TcpTransport;
//! use tokio::time::Instant;
//!
//! # async fn run() -> doorbell_link::Result<()> {
//! let mut connection = ConnectionBuilder::new("192.168.1.10")
//!     .port(2376)
//!     .mac("24:0a:c4:12:34:56".parse()?)
//!     .build(TcpTransport::default());
//!
//! connection.connect().await?;
//! loop {
//!     for event in connection.poll(Instant::now()).await? {
//!         println!("{event:?}");
//!     }
//!     connection.wait_for_activity(std::time::Duration::from_millis(50)).await;
//! }
//! # }
//! ```

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DoorbellError, Result};
use crate::protocol::{FrameAssembler, MacAddress, Packet, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::session::{ConnectionState, Session, SessionAction, SessionConfig, SessionEvent};
use crate::transport::Transport;
use crate::writer::{ReliableWriter, WriteReport, WriterConfig, WriterStats};

/// Default gateway port.
pub const DEFAULT_GATEWAY_PORT: u16 = 2376;

/// Default number of connection attempts per `connect` call.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default maximum bytes read from the transport per read call.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Builder for configuring and creating a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    host: String,
    port: u16,
    connect_attempts: u32,
    retry_delay: Duration,
    read_chunk_size: usize,
    max_payload_size: u32,
    writer_config: WriterConfig,
    session_config: SessionConfig,
}

impl ConnectionBuilder {
    /// Create a builder for the gateway at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_GATEWAY_PORT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer_config: WriterConfig::default(),
            session_config: SessionConfig::default(),
        }
    }

    /// Gateway port.
    ///
    /// Default: 2376
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Connection attempts per `connect` call (at least one is made).
    ///
    /// Default: 5
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Delay between connection attempts.
    ///
    /// Default: 100ms
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Maximum bytes taken from the transport per read.
    ///
    /// Default: 4096
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Largest inbound payload accepted; bigger packets are skipped.
    ///
    /// Default: 1 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Time a write may go without progress.
    ///
    /// Default: 3 seconds
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.ack_timeout = timeout;
        self
    }

    /// Wait between send-capacity checks while stalled.
    ///
    /// Default: 1ms
    pub fn retry_tick(mut self, tick: Duration) -> Self {
        self.writer_config.retry_tick = tick;
        self
    }

    /// Hardware address sent as identity.
    pub fn mac(mut self, mac: MacAddress) -> Self {
        self.session_config.mac = mac;
        self
    }

    /// Stream time granted by each StartStream.
    ///
    /// Default: 30.5 seconds
    pub fn stream_window(mut self, window: Duration) -> Self {
        self.session_config.stream_window = window;
        self
    }

    /// Minimum relay open time.
    ///
    /// Default: 5 seconds
    pub fn default_relay_open(mut self, duration: Duration) -> Self {
        self.session_config.default_relay_open = duration;
        self
    }

    /// Relay presence byte appended to the username (`None` to omit it).
    pub fn relay_flag(mut self, relay: Option<bool>) -> Self {
        self.session_config.relay_flag = relay;
        self
    }

    /// Build a manager around `transport`. Nothing is connected yet.
    pub fn build<T: Transport>(self, transport: T) -> ConnectionManager<T> {
        ConnectionManager {
            transport,
            assembler: FrameAssembler::with_max_payload(self.max_payload_size),
            session: Session::new(self.session_config),
            writer: ReliableWriter::new(self.writer_config),
            close: CancellationToken::new(),
            host: self.host,
            port: self.port,
            connect_attempts: self.connect_attempts,
            retry_delay: self.retry_delay,
            read_chunk_size: self.read_chunk_size,
        }
    }
}

/// One gateway connection and everything it owns.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    assembler: FrameAssembler,
    session: Session,
    writer: ReliableWriter,
    close: CancellationToken,
    host: String,
    port: u16,
    connect_attempts: u32,
    retry_delay: Duration,
    read_chunk_size: usize,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a new connection builder.
    pub fn builder(host: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(host)
    }

    /// Handshake state.
    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Check if a stream is open and the handshake has started.
    pub fn is_connected(&mut self) -> bool {
        self.session.state() != ConnectionState::Disconnected && !self.transport.is_closed()
    }

    /// The gateway is waiting for a username.
    pub fn needs_username(&self) -> bool {
        self.session.needs_username()
    }

    /// Session state machine (timers, capture windows).
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Writer counters.
    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Oversize inbound packets skipped so far.
    pub fn dropped_frames(&self) -> u64 {
        self.assembler.dropped_frames()
    }

    /// Token another task can cancel to close the current connection.
    ///
    /// Cancelling it unblocks any pending write or idle wait; the manager
    /// finishes closing on its next `poll`. Each connection gets a fresh
    /// token, so a handle only ever affects the connection it came from.
    pub fn close_handle(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Connect to the gateway and send the identity.
    ///
    /// Does nothing if already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.session.state() != ConnectionState::Disconnected || self.close.is_cancelled() {
            self.close();
        }

        for attempt in 1..=self.connect_attempts {
            match self.transport.connect(&self.host, self.port).await {
                Ok(()) => {
                    info!(
                        host = %self.host,
                        port = self.port,
                        attempt,
                        transport = self.transport.name(),
                        "Connected to gateway"
                    );
                    return self.start_handshake().await;
                }
                Err(e) => {
                    warn!(
                        host = %self.host,
                        port = self.port,
                        attempt,
                        error = %e,
                        "Connection attempt failed"
                    );
                    if attempt < self.connect_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(DoorbellError::ConnectFailed {
            host: self.host.clone(),
            port: self.port,
            attempts: self.connect_attempts,
        })
    }

    async fn start_handshake(&mut self) -> Result<()> {
        self.assembler.reset();
        let actions = self.session.on_connected();
        self.perform(actions).await?;
        Ok(())
    }

    /// Close the connection and reset all per-connection state.
    pub fn close(&mut self) {
        if self.session.state() != ConnectionState::Disconnected {
            info!(state = %self.session.state(), "Closing gateway connection");
        }
        self.transport.close();
        self.close.cancel();
        self.close = CancellationToken::new();
        self.assembler.reset();
        self.session.reset();
    }

    /// Run one cooperative iteration: read, reassemble, dispatch, respond.
    ///
    /// Returns the events produced, ending with
    /// [`SessionEvent::Disconnected`] if the connection went away.
    pub async fn poll(&mut self, now: Instant) -> Result<Vec<SessionEvent>> {
        if self.session.state() == ConnectionState::Disconnected {
            return Ok(Vec::new());
        }
        if self.close.is_cancelled() {
            self.close();
            return Ok(vec![SessionEvent::Disconnected]);
        }

        let mut events = Vec::new();
        loop {
            let available = self.transport.available_bytes();
            if available == 0 {
                break;
            }

            let requested = available.min(self.read_chunk_size);
            let chunk = self.transport.read_bytes(requested);
            if chunk.len() < requested {
                error!(
                    requested,
                    received = chunk.len(),
                    "Transport returned fewer bytes than available"
                );
                self.close();
                return Err(DoorbellError::TransportCorrupted {
                    requested,
                    received: chunk.len(),
                });
            }

            for packet in self.assembler.feed(&chunk) {
                debug!(packet_type = %packet.packet_type, len = packet.len(), "Received packet");
                let actions = self.session.handle_packet(&packet, now);
                events.extend(self.perform(actions).await?);
            }
        }

        if self.transport.is_closed() {
            info!("Gateway connection lost");
            self.close();
            events.push(SessionEvent::Disconnected);
        }

        Ok(events)
    }

    /// Sleep up to `idle`, waking early on transport activity or close.
    pub async fn wait_for_activity(&mut self, idle: Duration) {
        if self.session.state() == ConnectionState::Disconnected {
            tokio::time::sleep(idle).await;
            return;
        }
        tokio::select! {
            _ = self.close.cancelled() => {}
            _ = self.transport.wait_event() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }

    /// Answer the gateway's username request.
    pub async fn supply_username(&mut self, username: &str) -> Result<()> {
        let actions = self.session.supply_username(username)?;
        self.perform(actions).await?;
        Ok(())
    }

    /// Send a captured frame.
    ///
    /// A partial write is reported, not turned into an error; the caller
    /// decides whether to reconnect.
    pub async fn send_image(&mut self, image: Bytes) -> Result<WriteReport> {
        let packet = self.session.image(image).ok_or(DoorbellError::InvalidState {
            operation: "send_image",
            state: self.session.state(),
        })?;
        self.write(&packet).await
    }

    /// Report a bell press. Returns `None` when not ready.
    pub async fn bell_pressed(&mut self, now: Instant) -> Result<Option<WriteReport>> {
        match self.session.bell_pressed(now) {
            Some(packet) => Ok(Some(self.write(&packet).await?)),
            None => Ok(None),
        }
    }

    /// Report detected motion. Returns `None` when not ready.
    pub async fn motion_detected(&mut self, now: Instant) -> Result<Option<WriteReport>> {
        match self.session.motion_detected(now) {
            Some(packet) => Ok(Some(self.write(&packet).await?)),
            None => Ok(None),
        }
    }

    /// Whether a frame should be captured now.
    pub fn is_stream_requested(&mut self, now: Instant) -> bool {
        self.session.is_stream_requested(now)
    }

    /// Whether the relay should be open now.
    pub fn is_relay_requested(&mut self, now: Instant) -> bool {
        self.session.is_relay_requested(now)
    }

    async fn write(&mut self, packet: &Packet) -> Result<WriteReport> {
        self.writer
            .write_packet(&mut self.transport, packet, &self.close)
            .await
    }

    /// Carry out session actions. Handshake sends must complete; a partial
    /// one closes the connection.
    async fn perform(&mut self, actions: Vec<SessionAction>) -> Result<Vec<SessionEvent>> {
        let mut events = Vec::new();
        for action in actions {
            match action {
                SessionAction::Send(packet) => {
                    let report = self.write(&packet).await?;
                    if !report.is_complete() {
                        error!(
                            packet_type = %packet.packet_type,
                            written = report.written,
                            total = report.total,
                            "Handshake packet not delivered"
                        );
                        self.close();
                        report.into_result()?;
                    }
                }
                SessionAction::Notify(event) => events.push(event),
            }
        }
        Ok(events)
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.close.cancel();
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConfigPayload, CaptureWindow, PacketType, UsernameAck};
    use crate::transport::{memory_pair, MemoryPeer, MemoryTransport};

    const MAC: MacAddress = MacAddress([0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]);

    fn manager() -> (ConnectionManager<MemoryTransport>, MemoryPeer) {
        let (transport, peer) = memory_pair(4096);
        let manager = ConnectionBuilder::new("gateway")
            .mac(MAC)
            .retry_delay(Duration::from_millis(10))
            .build(transport);
        (manager, peer)
    }

    fn config(registration_required: bool) -> Packet {
        ConfigPayload {
            registration_required,
            bell_capture: CaptureWindow::SingleFrame,
            motion_capture: CaptureWindow::SingleFrame,
            relay_open: Duration::ZERO,
        }
        .to_packet()
    }

    #[test]
    fn test_builder_configuration() {
        let builder = ConnectionBuilder::new("10.0.0.2")
            .port(9000)
            .connect_attempts(0)
            .read_chunk_size(0)
            .ack_timeout(Duration::from_secs(1))
            .retry_tick(Duration::from_millis(5));

        assert_eq!(builder.host, "10.0.0.2");
        assert_eq!(builder.port, 9000);
        assert_eq!(builder.connect_attempts, 1);
        assert_eq!(builder.read_chunk_size, 1);
        assert_eq!(builder.writer_config.ack_timeout, Duration::from_secs(1));
        assert_eq!(builder.writer_config.retry_tick, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_connect_sends_identity() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::IdentitySent);
        assert_eq!(peer.last_endpoint(), Some(("gateway".to_string(), 2376)));
        assert_eq!(
            &peer.take_output()[..],
            &[0, 0, 0, 6, 1, 0x24, 0x0A, 0xC4, 0x12, 0x34, 0x56]
        );

        // Already connected: no second connect, no second identity.
        manager.connect().await.unwrap();
        assert_eq!(peer.connection_count(), 1);
        assert!(peer.take_output().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_fails() {
        let (mut manager, peer) = manager();
        peer.set_accepting(false);

        let start = Instant::now();
        let result = manager.connect().await;

        assert!(matches!(
            result,
            Err(DoorbellError::ConnectFailed { attempts: 5, .. })
        ));
        // Four delays between five attempts.
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_to_ready() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();

        peer.push_packet(&config(false));
        let events = manager.poll(Instant::now()).await.unwrap();

        assert_eq!(events, vec![SessionEvent::Ready]);
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_registration_flow() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();
        peer.take_output();

        peer.push_packet(&config(true));
        let events = manager.poll(Instant::now()).await.unwrap();
        assert_eq!(events, vec![SessionEvent::UsernameRequired]);
        assert!(manager.needs_username());

        manager.supply_username("alice").await.unwrap();
        let packets = peer.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::Username);
        assert_eq!(packets[0].payload(), b"alice\x00");

        peer.push_packet(&UsernameAck { accepted: true }.to_packet());
        let events = manager.poll(Instant::now()).await.unwrap();
        assert_eq!(events, vec![SessionEvent::Registered, SessionEvent::Ready]);
    }

    #[tokio::test]
    async fn test_packets_split_across_reads() {
        let (transport, peer) = memory_pair(4096);
        let mut manager = ConnectionBuilder::new("gateway")
            .read_chunk_size(3)
            .build(transport);
        manager.connect().await.unwrap();

        let mut wire = config(false).encode().unwrap().to_vec();
        wire.extend_from_slice(&Packet::empty(PacketType::StartStream).encode().unwrap());
        peer.push_split(&wire, &[1, 7, 2]);

        let events = manager.poll(Instant::now()).await.unwrap();
        assert_eq!(events, vec![SessionEvent::Ready, SessionEvent::StreamStarted]);
        assert!(manager.is_stream_requested(Instant::now()));
    }

    #[tokio::test]
    async fn test_peer_close_resets_to_disconnected() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();
        peer.push_packet(&config(false));
        peer.push_packet(&Packet::empty(PacketType::StartStream));
        peer.close();

        let events = manager.poll(Instant::now()).await.unwrap();

        assert_eq!(
            events,
            vec![
                SessionEvent::Ready,
                SessionEvent::StreamStarted,
                SessionEvent::Disconnected
            ]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_stream_requested(Instant::now()));
        assert!(manager.poll(Instant::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_restarts_handshake() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();
        peer.push_packet(&config(false));
        manager.poll(Instant::now()).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Ready);

        manager.close();
        assert!(!peer.is_connected());
        peer.take_output();

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::IdentitySent);
        assert_eq!(peer.connection_count(), 2);
        let packets = peer.take_packets();
        assert_eq!(packets[0].packet_type, PacketType::Identity);
    }

    #[tokio::test]
    async fn test_close_handle_from_another_task() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();
        peer.push_packet(&config(false));
        manager.poll(Instant::now()).await.unwrap();

        let handle = manager.close_handle();
        tokio::spawn(async move { handle.cancel() }).await.unwrap();

        let events = manager.poll(Instant::now()).await.unwrap();
        assert_eq!(events, vec![SessionEvent::Disconnected]);
        assert!(!manager.close_handle().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_identity_closes_connection() {
        let (transport, peer) = memory_pair(4096);
        let mut manager = ConnectionBuilder::new("gateway")
            .ack_timeout(Duration::from_millis(50))
            .build(transport);
        peer.script_capacity(std::iter::repeat(0).take(1_000));

        let result = manager.connect().await;

        assert!(matches!(
            result,
            Err(DoorbellError::WriteIncomplete {
                written: 0,
                total: 11
            })
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_device_events_when_ready() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();

        let now = Instant::now();
        assert!(manager.bell_pressed(now).await.unwrap().is_none());
        assert!(matches!(
            manager.send_image(Bytes::from_static(b"jpeg")).await,
            Err(DoorbellError::InvalidState { .. })
        ));

        peer.push_packet(&config(false));
        manager.poll(now).await.unwrap();
        peer.take_output();

        let report = manager.bell_pressed(now).await.unwrap().unwrap();
        assert!(report.is_complete());
        assert!(manager.is_stream_requested(now));

        manager.motion_detected(now).await.unwrap();
        let report = manager.send_image(Bytes::from_static(b"jpeg")).await.unwrap();
        assert_eq!(report.total, 9);

        let types: Vec<_> = peer.take_packets().iter().map(|p| p.packet_type).collect();
        assert_eq!(
            types,
            vec![
                PacketType::BellPressed,
                PacketType::MotionDetected,
                PacketType::Image
            ]
        );
        assert_eq!(manager.writer_stats().packets_sent, 4);
    }

    #[tokio::test]
    async fn test_oversize_packet_is_counted_and_skipped() {
        let (transport, peer) = memory_pair(4096);
        let mut manager = ConnectionBuilder::new("gateway")
            .max_payload_size(16)
            .build(transport);
        manager.connect().await.unwrap();

        peer.push_packet(&Packet::new(PacketType::Image, vec![0u8; 64]));
        peer.push_packet(&config(false));

        let events = manager.poll(Instant::now()).await.unwrap();
        assert_eq!(events, vec![SessionEvent::Ready]);
        assert_eq!(manager.dropped_frames(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_activity_wakes_on_data() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();

        let pusher = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pusher.push_packet(&Packet::empty(PacketType::StartStream));
        });

        let start = Instant::now();
        manager.wait_for_activity(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_short_read_closes_connection() {
        let (mut manager, peer) = manager();
        manager.connect().await.unwrap();

        peer.script_reads([2]);
        peer.push_packet(&Packet::empty(PacketType::StartStream));
        let result = manager.poll(Instant::now()).await;

        assert!(matches!(
            result,
            Err(DoorbellError::TransportCorrupted {
                requested: 5,
                received: 2
            })
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.transport.is_closed());
        assert!(!peer.is_connected());
        assert!(manager.assembler.is_idle());

        manager.connect().await.unwrap();
        assert_eq!(peer.connection_count(), 2);
        assert_eq!(manager.state(), ConnectionState::IdentitySent);
    }
}
