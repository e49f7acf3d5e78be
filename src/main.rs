//! Doorbell CLI - runs the device loop against a real gateway.
//!
//! Hardware is simulated from the terminal: type `bell` or `motion` (or just
//! `b` / `m`) on stdin to trigger, relay changes are logged, and camera
//! frames come from an image file.

use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use doorbell_link::config::{init_logging, DeviceConfig};
use doorbell_link::device::{Application, DeviceLoop, Trigger};
use doorbell_link::session::SessionEvent;
use doorbell_link::transport::TcpTransport;
use doorbell_link::Result;

/// Camera doorbell talking to its gateway
#[derive(Parser, Debug)]
#[command(name = "doorbell", author, version, about)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway host, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    /// Gateway port, overrides the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Station MAC (aa:bb:cc:dd:ee:ff), overrides the configuration
    #[arg(long)]
    mac: Option<String>,

    /// Username for gateways that require registration
    #[arg(short, long)]
    username: Option<String>,

    /// JPEG file sent as every camera frame
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn device_config(&self) -> Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => DeviceConfig::load(path)?,
            None => DeviceConfig::default(),
        };

        if let Some(host) = &self.host {
            config.gateway.host = host.clone();
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(mac) = &self.mac {
            config.identity.mac = mac.clone();
        }
        if let Some(username) = &self.username {
            config.registration.username = Some(username.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json {
            config.logging.format = "json".to_string();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Terminal-driven stand-in for the doorbell hardware.
struct ConsoleDoorbell {
    triggers: mpsc::UnboundedReceiver<Trigger>,
    username: Option<String>,
    frame: Option<Bytes>,
    frames_sent: u64,
}

impl Application for ConsoleDoorbell {
    fn capture_image(&mut self) -> Option<Bytes> {
        let frame = self.frame.clone()?;
        self.frames_sent += 1;
        Some(frame)
    }

    fn username(&mut self) -> Option<String> {
        self.username.clone()
    }

    fn take_trigger(&mut self) -> Option<Trigger> {
        self.triggers.try_recv().ok()
    }

    fn set_relay(&mut self, open: bool) {
        info!(open, "Relay");
    }

    fn on_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::UsernameRequired if self.username.is_none() => {
                warn!("Gateway requires a username, restart with --username")
            }
            SessionEvent::RegistrationRejected => {
                warn!(username = ?self.username.take(), "Username rejected by gateway")
            }
            SessionEvent::StreamStopped => {
                info!(frames = self.frames_sent, "Stream stopped")
            }
            other => info!(event = ?other, "Session"),
        }
    }
}

fn parse_trigger(line: &str) -> Option<Trigger> {
    match line.trim().to_ascii_lowercase().as_str() {
        "b" | "bell" => Some(Trigger::BellPressed),
        "m" | "motion" => Some(Trigger::MotionDetected),
        _ => None,
    }
}

fn spawn_stdin_triggers(tx: mpsc::UnboundedSender<Trigger>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_trigger(&line) {
                Some(trigger) => {
                    if tx.send(trigger).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(input = %line.trim(), "Unknown command, use bell or motion"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.device_config()?;
    init_logging(&config.logging)?;

    let frame = match &cli.image {
        Some(path) => Some(Bytes::from(tokio::fs::read(path).await?)),
        None => None,
    };
    if frame.is_none() {
        warn!("No --image given, stream requests will send nothing");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    spawn_stdin_triggers(tx);

    let app = ConsoleDoorbell {
        triggers: rx,
        username: config.registration.username.clone(),
        frame,
        frames_sent: 0,
    };

    let connection = config
        .connection_builder()?
        .build(TcpTransport::new(config.tcp_config()));
    let mut device = DeviceLoop::new(connection, app, config.loop_config());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        on_signal.cancel();
    });

    info!(
        host = %config.gateway.host,
        port = config.gateway.port,
        "Starting doorbell"
    );
    device.run(shutdown).await
}
