//! # doorbell-link
//!
//! Connection and protocol core for a camera doorbell talking to its gateway.
//!
//! The device keeps one TCP stream to the gateway and exchanges small framed
//! packets over it: identity and configuration during the handshake, then
//! bell and motion events, relay commands and camera frames.
//!
//! ## Architecture
//!
//! - **Protocol**: `[u32 BE length][u8 type][payload]` frames, reassembled
//!   from arbitrary chunks by a [`FrameAssembler`](protocol::FrameAssembler)
//! - **Writer**: delivers a whole packet through a bounded send window,
//!   giving up when no progress is made within the ACK timeout
//! - **Session**: the handshake state machine and the stream/relay timers
//! - **Connection**: owns transport, assembler, session and writer for one
//!   gateway link and drives them from a cooperative `poll`
//! - **Device**: the firmware main loop around a connection
//!
//! ## Example
//!
//! ```no_run
//! use doorbell_link::{ConnectionBuilder, DeviceLoop, LoopConfig};
//! use doorbell_link::device::{Application, Trigger};
//! use doorbell_link::transport::TcpTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Hardware;
//!
//! impl Application for Hardware {
//!     fn capture_image(&mut self) -> Option<bytes::Bytes> { None }
//!     fn username(&mut self) -> Option<String> { Some("alice".into()) }
//!     fn take_trigger(&mut self) -> Option<Trigger> { None }
//!     fn set_relay(&mut self, _open: bool) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> doorbell_link::Result<()> {
//!     let connection = ConnectionBuilder::new("192.168.1.10")
//!         .mac("24:0a:c4:12:34:56".parse()?)
//!         .build(TcpTransport::default());
//!
//!     let mut device = DeviceLoop::new(connection, Hardware, LoopConfig::default());
//!     device.run(CancellationToken::new()).await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod writer;

mod backpressure;

pub use connection::{ConnectionBuilder, ConnectionManager};
pub use device::{Application, DeviceLoop, LoopConfig, Trigger};
pub use error::{DoorbellError, Result};
pub use session::{ConnectionState, SessionEvent};
