//! Handshake state machine and capture/relay timers.
//!
//! [`Session`] holds no I/O. Decoded packets go in through
//! [`Session::handle_packet`]; what the device must do in response comes out
//! as [`SessionAction`]s, which the connection manager performs.
//!
//! ```text
//! Disconnected ──connect──► IdentitySent ──Config(flags=0)──────────────► Ready
//!                                │                                         ▲
//!                         Config(flags=1)                                  │
//!                                ▼                                         │
//!                         ConfigReceived ──username──► UsernameSent ──ack(1)┘
//!                                ▲                          │
//!                                └────────── ack(0) ────────┘
//! ```

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DoorbellError, Result};
use crate::protocol::{
    CaptureWindow, ConfigPayload, MacAddress, Packet, PacketType, UsernameAck, UsernamePayload,
};

/// How long a StartStream request keeps the camera streaming.
pub const DEFAULT_STREAM_WINDOW: Duration = Duration::from_millis(30_500);

/// Minimum relay open time, whatever the gateway configures.
pub const DEFAULT_RELAY_OPEN: Duration = Duration::from_secs(5);

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    IdentitySent,
    ConfigReceived,
    UsernameSent,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::IdentitySent => "identity-sent",
            ConnectionState::ConfigReceived => "config-received",
            ConnectionState::UsernameSent => "username-sent",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The gateway wants a username before the device can be used.
    UsernameRequired,
    /// The gateway accepted the username.
    Registered,
    /// The gateway refused the username.
    RegistrationRejected,
    /// Handshake finished.
    Ready,
    StreamStarted,
    StreamStopped,
    /// Relay should stay open for the given time.
    RelayOpened(Duration),
    /// The connection was lost or closed.
    Disconnected,
}

/// Output of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write this packet to the gateway.
    Send(Packet),
    /// Report this event to the application.
    Notify(SessionEvent),
}

/// Per-device session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Hardware address sent as identity.
    pub mac: MacAddress,
    /// Stream time granted by a StartStream packet.
    pub stream_window: Duration,
    /// Floor for the configured relay open time.
    pub default_relay_open: Duration,
    /// Relay presence byte appended to the username, if any.
    pub relay_flag: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mac: MacAddress::default(),
            stream_window: DEFAULT_STREAM_WINDOW,
            default_relay_open: DEFAULT_RELAY_OPEN,
            relay_flag: Some(false),
        }
    }
}

/// Absolute deadlines and one-shot flags driving capture and the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTimers {
    pub stream_until: Option<Instant>,
    pub bell_capture_until: Option<Instant>,
    pub motion_capture_until: Option<Instant>,
    pub open_relay_until: Option<Instant>,
    /// Bell pressed with a single-frame window; one capture owed.
    pub bell_pending: bool,
    /// Motion detected with a single-frame window; one capture owed.
    pub motion_pending: bool,
}

/// Returns whether `deadline` is still in the future, clearing it otherwise.
fn check_deadline(deadline: &mut Option<Instant>, now: Instant) -> bool {
    match *deadline {
        Some(until) if now < until => true,
        Some(_) => {
            *deadline = None;
            false
        }
        None => false,
    }
}

fn extend_deadline(deadline: &mut Option<Instant>, until: Instant) {
    *deadline = Some(deadline.map_or(until, |current| current.max(until)));
}

/// Connection state machine for one gateway link.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: ConnectionState,
    bell_capture: CaptureWindow,
    motion_capture: CaptureWindow,
    relay_open: Duration,
    timers: SessionTimers,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let relay_open = config.default_relay_open;
        Self {
            config,
            state: ConnectionState::Disconnected,
            bell_capture: CaptureWindow::SingleFrame,
            motion_capture: CaptureWindow::SingleFrame,
            relay_open,
            timers: SessionTimers::default(),
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the handshake has finished.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// The gateway is waiting for a username.
    pub fn needs_username(&self) -> bool {
        self.state == ConnectionState::ConfigReceived
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn timers(&self) -> &SessionTimers {
        &self.timers
    }

    /// Capture window applied after a bell press.
    pub fn bell_capture(&self) -> CaptureWindow {
        self.bell_capture
    }

    /// Capture window applied after motion.
    pub fn motion_capture(&self) -> CaptureWindow {
        self.motion_capture
    }

    /// Relay open time for the next OpenRelay.
    pub fn relay_open(&self) -> Duration {
        self.relay_open
    }

    /// Back to `Disconnected` with timers, flags and durations cleared.
    pub fn reset(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(from = %self.state, "Session reset");
        }
        self.state = ConnectionState::Disconnected;
        self.bell_capture = CaptureWindow::SingleFrame;
        self.motion_capture = CaptureWindow::SingleFrame;
        self.relay_open = self.config.default_relay_open;
        self.timers = SessionTimers::default();
    }

    /// A fresh stream is up: start the handshake by sending the identity.
    pub fn on_connected(&mut self) -> Vec<SessionAction> {
        self.reset();
        self.transition(ConnectionState::IdentitySent);
        vec![SessionAction::Send(self.config.mac.to_packet())]
    }

    /// Feed one decoded packet from the gateway.
    pub fn handle_packet(&mut self, packet: &Packet, now: Instant) -> Vec<SessionAction> {
        use ConnectionState as S;
        use PacketType as T;

        match (self.state, packet.packet_type) {
            (S::IdentitySent, T::Identity) => {
                debug!("Gateway asked for the identity again");
                vec![SessionAction::Send(self.config.mac.to_packet())]
            }
            (S::IdentitySent, T::Config) => self.apply_config(packet.payload()),
            (S::UsernameSent, T::Username) => self.apply_username_ack(packet.payload()),
            (S::Ready, T::StartStream) => {
                self.timers.stream_until = Some(now + self.config.stream_window);
                debug!(window_ms = self.config.stream_window.as_millis() as u64, "Stream requested");
                vec![SessionAction::Notify(SessionEvent::StreamStarted)]
            }
            (S::Ready, T::StopStream) => {
                self.timers.stream_until = None;
                self.timers.bell_capture_until = None;
                self.timers.motion_capture_until = None;
                debug!("Stream stopped");
                vec![SessionAction::Notify(SessionEvent::StreamStopped)]
            }
            (S::Ready, T::OpenRelay) => {
                self.timers.open_relay_until = Some(now + self.relay_open);
                debug!(open_ms = self.relay_open.as_millis() as u64, "Relay opened");
                vec![SessionAction::Notify(SessionEvent::RelayOpened(self.relay_open))]
            }
            (state, packet_type) => {
                warn!(%state, %packet_type, len = packet.len(), "Unexpected packet, ignoring");
                Vec::new()
            }
        }
    }

    fn apply_config(&mut self, payload: &[u8]) -> Vec<SessionAction> {
        let config = match ConfigPayload::decode(payload) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Dropping config");
                return Vec::new();
            }
        };

        self.bell_capture = self.bell_capture.max(config.bell_capture);
        self.motion_capture = self.motion_capture.max(config.motion_capture);
        self.relay_open = self.relay_open.max(config.relay_open);
        debug!(
            bell = ?self.bell_capture,
            motion = ?self.motion_capture,
            relay_ms = self.relay_open.as_millis() as u64,
            registration_required = config.registration_required,
            "Config applied"
        );

        if config.registration_required {
            info!("Device not registered yet, requesting username");
            self.transition(ConnectionState::ConfigReceived);
            vec![SessionAction::Notify(SessionEvent::UsernameRequired)]
        } else {
            self.transition(ConnectionState::Ready);
            vec![SessionAction::Notify(SessionEvent::Ready)]
        }
    }

    fn apply_username_ack(&mut self, payload: &[u8]) -> Vec<SessionAction> {
        let ack = match UsernameAck::decode(payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "Dropping username ack");
                return Vec::new();
            }
        };

        if ack.accepted {
            info!("Device registered");
            self.transition(ConnectionState::Ready);
            vec![
                SessionAction::Notify(SessionEvent::Registered),
                SessionAction::Notify(SessionEvent::Ready),
            ]
        } else {
            warn!("Username rejected, requesting it again");
            self.transition(ConnectionState::ConfigReceived);
            vec![
                SessionAction::Notify(SessionEvent::RegistrationRejected),
                SessionAction::Notify(SessionEvent::UsernameRequired),
            ]
        }
    }

    /// Answer a username request.
    ///
    /// Only valid while the gateway is waiting for one.
    pub fn supply_username(&mut self, username: &str) -> Result<Vec<SessionAction>> {
        if self.state != ConnectionState::ConfigReceived {
            return Err(DoorbellError::InvalidState {
                operation: "supply_username",
                state: self.state,
            });
        }
        let payload = UsernamePayload::new(username, self.config.relay_flag)?;
        self.transition(ConnectionState::UsernameSent);
        Ok(vec![SessionAction::Send(payload.to_packet())])
    }

    /// The bell was pressed. Returns the packet to send when ready.
    pub fn bell_pressed(&mut self, now: Instant) -> Option<Packet> {
        if !self.is_ready() {
            debug!(state = %self.state, "Bell press ignored before ready");
            return None;
        }
        match self.bell_capture {
            CaptureWindow::For(window) => {
                extend_deadline(&mut self.timers.bell_capture_until, now + window)
            }
            CaptureWindow::SingleFrame => self.timers.bell_pending = true,
        }
        Some(Packet::empty(PacketType::BellPressed))
    }

    /// Motion was detected. Returns the packet to send when ready.
    pub fn motion_detected(&mut self, now: Instant) -> Option<Packet> {
        if !self.is_ready() {
            debug!(state = %self.state, "Motion ignored before ready");
            return None;
        }
        match self.motion_capture {
            CaptureWindow::For(window) => {
                extend_deadline(&mut self.timers.motion_capture_until, now + window)
            }
            CaptureWindow::SingleFrame => self.timers.motion_pending = true,
        }
        Some(Packet::empty(PacketType::MotionDetected))
    }

    /// Wrap a captured frame. Returns `None` before the handshake is done.
    pub fn image(&self, image: Bytes) -> Option<Packet> {
        if !self.is_ready() {
            return None;
        }
        Some(Packet::new(PacketType::Image, image))
    }

    /// Whether a frame should be captured now.
    ///
    /// A pending single-frame request is consumed by the call that reports it.
    pub fn is_stream_requested(&mut self, now: Instant) -> bool {
        if !self.is_ready() {
            return false;
        }
        if self.timers.bell_pending {
            self.timers.bell_pending = false;
            return true;
        }
        if self.timers.motion_pending {
            self.timers.motion_pending = false;
            return true;
        }

        let stream = check_deadline(&mut self.timers.stream_until, now);
        let bell = check_deadline(&mut self.timers.bell_capture_until, now);
        let motion = check_deadline(&mut self.timers.motion_capture_until, now);
        stream || bell || motion
    }

    /// Whether the relay should currently be open.
    pub fn is_relay_requested(&mut self, now: Instant) -> bool {
        if !self.is_ready() {
            return false;
        }
        check_deadline(&mut self.timers.open_relay_until, now)
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(from = %self.state, to = %next, "Session state");
        self.state = next;
    }
}
