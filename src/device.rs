//! Device main loop.
//!
//! Drives a [`ConnectionManager`] the way the doorbell firmware does: keep the
//! gateway connected, answer registration, forward bell and motion triggers,
//! drive the relay output and stream camera frames while the gateway (or a
//! recent trigger) asks for them.
//!
//! Camera, buttons and relay stay outside this crate; they are reached
//! through the [`Application`] trait.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{DoorbellError, Result};
use crate::session::{ConnectionState, SessionEvent};
use crate::transport::Transport;
use crate::writer::WriteReport;

/// Default pause between idle loop iterations.
pub const DEFAULT_LOOP_DELAY: Duration = Duration::from_millis(50);

/// Default consecutive failed `connect` calls before the loop gives up.
pub const DEFAULT_MAX_CONNECT_FAILURES: u32 = 10;

/// Input from the device hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    BellPressed,
    MotionDetected,
}

/// Hardware and user-facing side of the device.
pub trait Application: Send {
    /// Grab a camera frame. `None` if the camera has nothing right now.
    fn capture_image(&mut self) -> Option<Bytes>;

    /// Username to register with. `None` if the user has not entered one yet.
    fn username(&mut self) -> Option<String>;

    /// Next pending hardware trigger, if any.
    fn take_trigger(&mut self) -> Option<Trigger>;

    /// Open or close the door relay.
    fn set_relay(&mut self, open: bool);

    /// Session progress notification.
    fn on_event(&mut self, _event: &SessionEvent) {}
}

/// Device loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Idle pause between iterations.
    pub loop_delay: Duration,
    /// Consecutive failed `connect` calls tolerated.
    pub max_connect_failures: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_delay: DEFAULT_LOOP_DELAY,
            max_connect_failures: DEFAULT_MAX_CONNECT_FAILURES,
        }
    }
}

/// The firmware main loop around one connection.
pub struct DeviceLoop<T: Transport, A: Application> {
    connection: ConnectionManager<T>,
    app: A,
    config: LoopConfig,
    connect_failures: u32,
    relay_open: bool,
}

impl<T: Transport, A: Application> DeviceLoop<T, A> {
    pub fn new(connection: ConnectionManager<T>, app: A, config: LoopConfig) -> Self {
        Self {
            connection,
            app,
            config,
            connect_failures: 0,
            relay_open: false,
        }
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.connection
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Consecutive failed connects since the last success.
    pub fn connect_failures(&self) -> u32 {
        self.connect_failures
    }

    /// Run one iteration. Returns `true` if a frame was streamed, meaning
    /// the next iteration should follow without an idle pause.
    pub async fn run_once(&mut self, now: Instant) -> Result<bool> {
        if self.connection.state() == ConnectionState::Disconnected {
            self.drive_relay(false);
            return self.reconnect().await.map(|_| false);
        }

        let events = match self.connection.poll(now).await {
            Ok(events) => events,
            Err(e) if e.is_fatal_for_connection() => {
                warn!(error = %e, "Connection dropped");
                self.notify(SessionEvent::Disconnected);
                self.drive_relay(false);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        for event in &events {
            self.notify(*event);
        }

        if self.connection.needs_username() {
            self.register().await?;
        }

        while let Some(trigger) = self.app.take_trigger() {
            let report = match trigger {
                Trigger::BellPressed => self.connection.bell_pressed(now).await?,
                Trigger::MotionDetected => self.connection.motion_detected(now).await?,
            };
            match report {
                Some(report) => self.check_delivery(report, "trigger"),
                None => debug!(?trigger, "Trigger dropped, gateway not ready"),
            }
        }

        let relay = self.connection.is_relay_requested(now);
        self.drive_relay(relay);

        if !self.connection.is_stream_requested(now) {
            return Ok(false);
        }
        let Some(image) = self.app.capture_image() else {
            return Ok(false);
        };
        let report = self.connection.send_image(image).await?;
        self.check_delivery(report, "image");
        Ok(true)
    }

    /// Run until `shutdown` is cancelled or the gateway stays unreachable.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            loop_delay_ms = self.config.loop_delay.as_millis() as u64,
            "Device loop started"
        );

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            let busy = match self.run_once(Instant::now()).await {
                Ok(busy) => busy,
                Err(e) => break Err(e),
            };

            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = self.connection.wait_for_activity(self.config.loop_delay) => {}
            }
        };

        self.connection.close();
        self.drive_relay(false);
        match &result {
            Ok(()) => info!("Device loop stopped"),
            Err(e) => error!(error = %e, "Device loop failed"),
        }
        result
    }

    async fn reconnect(&mut self) -> Result<()> {
        match self.connection.connect().await {
            Ok(()) => {
                self.connect_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.connect_failures += 1;
                warn!(
                    error = %e,
                    failures = self.connect_failures,
                    max = self.config.max_connect_failures,
                    "Gateway unreachable"
                );
                if self.connect_failures >= self.config.max_connect_failures {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn register(&mut self) -> Result<()> {
        let Some(username) = self.app.username() else {
            return Ok(());
        };
        match self.connection.supply_username(&username).await {
            Ok(()) => {
                info!(%username, "Username sent");
                Ok(())
            }
            Err(DoorbellError::InvalidUsername(reason)) => {
                warn!(%reason, "Username not usable");
                Ok(())
            }
            Err(e) if e.is_fatal_for_connection() => {
                warn!(error = %e, "Registration interrupted");
                self.notify(SessionEvent::Disconnected);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn check_delivery(&mut self, report: WriteReport, what: &str) {
        if !report.is_complete() {
            warn!(
                what,
                written = report.written,
                total = report.total,
                status = ?report.status,
                "Send incomplete, reconnecting"
            );
            self.connection.close();
            self.notify(SessionEvent::Disconnected);
        }
    }

    fn drive_relay(&mut self, open: bool) {
        if open != self.relay_open {
            debug!(open, "Relay");
            self.relay_open = open;
            self.app.set_relay(open);
        }
    }

    fn notify(&mut self, event: SessionEvent) {
        self.app.on_event(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::protocol::{CaptureWindow, ConfigPayload, Packet, PacketType, UsernameAck};
    use crate::transport::{memory_pair, MemoryPeer, MemoryTransport};

    #[derive(Default)]
    struct FakeDoorbell {
        username: Option<String>,
        triggers: VecDeque<Trigger>,
        frames: usize,
        relay: Vec<bool>,
        events: Vec<SessionEvent>,
    }

    impl Application for FakeDoorbell {
        fn capture_image(&mut self) -> Option<Bytes> {
            self.frames += 1;
            Some(Bytes::from(vec![0xFF, 0xD8, self.frames as u8]))
        }

        fn username(&mut self) -> Option<String> {
            self.username.clone()
        }

        fn take_trigger(&mut self) -> Option<Trigger> {
            self.triggers.pop_front()
        }

        fn set_relay(&mut self, open: bool) {
            self.relay.push(open);
        }

        fn on_event(&mut self, event: &SessionEvent) {
            self.events.push(*event);
        }
    }

    fn device(app: FakeDoorbell) -> (DeviceLoop<MemoryTransport, FakeDoorbell>, MemoryPeer) {
        let (transport, peer) = memory_pair(8192);
        let connection = ConnectionBuilder::new("gateway")
            .connect_attempts(1)
            .build(transport);
        let config = LoopConfig {
            loop_delay: Duration::from_millis(5),
            max_connect_failures: 3,
        };
        (DeviceLoop::new(connection, app, config), peer)
    }

    fn config(registration_required: bool, bell: CaptureWindow, relay_ms: u64) -> Packet {
        ConfigPayload {
            registration_required,
            bell_capture: bell,
            motion_capture: CaptureWindow::SingleFrame,
            relay_open: Duration::from_millis(relay_ms),
        }
        .to_packet()
    }

    fn types(peer: &MemoryPeer) -> Vec<PacketType> {
        peer.take_packets().iter().map(|p| p.packet_type).collect()
    }

    #[tokio::test]
    async fn test_registers_with_application_username() {
        let (mut device, peer) = device(FakeDoorbell {
            username: Some("alice".to_string()),
            ..FakeDoorbell::default()
        });
        let now = Instant::now();

        device.run_once(now).await.unwrap();
        assert_eq!(types(&peer), vec![PacketType::Identity]);

        peer.push_packet(&config(true, CaptureWindow::SingleFrame, 0));
        device.run_once(now).await.unwrap();
        let packets = peer.take_packets();
        assert_eq!(packets[0].packet_type, PacketType::Username);
        assert_eq!(packets[0].payload(), b"alice\x00");

        peer.push_packet(&UsernameAck { accepted: true }.to_packet());
        device.run_once(now).await.unwrap();

        assert_eq!(device.connection().state(), ConnectionState::Ready);
        assert_eq!(
            device.app().events,
            vec![
                SessionEvent::UsernameRequired,
                SessionEvent::Registered,
                SessionEvent::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_waits_for_username_from_user() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.push_packet(&config(true, CaptureWindow::SingleFrame, 0));

        device.run_once(now).await.unwrap();
        assert_eq!(types(&peer), vec![PacketType::Identity]);
        assert!(device.connection().needs_username());

        device.app_mut().username = Some("bob".to_string());
        device.run_once(now).await.unwrap();
        assert_eq!(types(&peer), vec![PacketType::Username]);
    }

    #[tokio::test]
    async fn test_single_frame_bell_sends_one_image() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.push_packet(&config(false, CaptureWindow::SingleFrame, 0));
        device.run_once(now).await.unwrap();
        peer.take_packets();

        device.app_mut().triggers.push_back(Trigger::BellPressed);
        assert!(device.run_once(now).await.unwrap());
        assert!(!device.run_once(now).await.unwrap());

        assert_eq!(types(&peer), vec![PacketType::BellPressed, PacketType::Image]);
        assert_eq!(device.app().frames, 1);
    }

    #[tokio::test]
    async fn test_streams_during_bell_window() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.push_packet(&config(
            false,
            CaptureWindow::For(Duration::from_secs(2)),
            0,
        ));
        device.run_once(now).await.unwrap();
        peer.take_packets();

        device.app_mut().triggers.push_back(Trigger::BellPressed);
        assert!(device.run_once(now).await.unwrap());
        assert!(device.run_once(now + Duration::from_secs(1)).await.unwrap());
        assert!(!device.run_once(now + Duration::from_secs(2)).await.unwrap());
        assert_eq!(device.app().frames, 2);
    }

    #[tokio::test]
    async fn test_relay_follows_gateway_request() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.push_packet(&config(false, CaptureWindow::SingleFrame, 6000));
        device.run_once(now).await.unwrap();

        peer.push_packet(&Packet::empty(PacketType::OpenRelay));
        device.run_once(now).await.unwrap();
        assert_eq!(device.app().relay, vec![true]);

        device.run_once(now + Duration::from_secs(5)).await.unwrap();
        device.run_once(now + Duration::from_secs(6)).await.unwrap();
        assert_eq!(device.app().relay, vec![true, false]);
    }

    #[tokio::test]
    async fn test_reconnects_after_gateway_close() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.close();

        device.run_once(now).await.unwrap();
        assert_eq!(device.connection().state(), ConnectionState::Disconnected);
        assert!(device.app().events.contains(&SessionEvent::Disconnected));

        device.run_once(now).await.unwrap();
        assert_eq!(peer.connection_count(), 2);
        assert_eq!(device.connection().state(), ConnectionState::IdentitySent);
    }

    #[tokio::test]
    async fn test_short_read_reconnects_next_iteration() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let now = Instant::now();
        device.run_once(now).await.unwrap();
        peer.push_packet(&config(false, CaptureWindow::SingleFrame, 0));
        device.run_once(now).await.unwrap();
        assert_eq!(device.connection().state(), ConnectionState::Ready);

        peer.script_reads([1]);
        peer.push_packet(&Packet::empty(PacketType::StartStream));
        assert!(!device.run_once(now).await.unwrap());
        assert_eq!(device.connection().state(), ConnectionState::Disconnected);
        assert_eq!(device.app().events.last(), Some(&SessionEvent::Disconnected));

        device.run_once(now).await.unwrap();
        assert_eq!(peer.connection_count(), 2);
        assert_eq!(device.connection().state(), ConnectionState::IdentitySent);
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_connect_failures() {
        let (mut device, peer) = device(FakeDoorbell::default());
        peer.set_accepting(false);
        let now = Instant::now();

        assert!(device.run_once(now).await.is_ok());
        assert!(device.run_once(now).await.is_ok());
        assert_eq!(device.connect_failures(), 2);
        assert!(matches!(
            device.run_once(now).await,
            Err(DoorbellError::ConnectFailed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (mut device, peer) = device(FakeDoorbell::default());
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        let gateway = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gateway.push_packet(&config(false, CaptureWindow::SingleFrame, 0));
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });

        device.run(shutdown).await.unwrap();

        assert!(device.app().events.contains(&SessionEvent::Ready));
        assert_eq!(device.connection().state(), ConnectionState::Disconnected);
        assert!(!peer.is_connected());
    }
}
