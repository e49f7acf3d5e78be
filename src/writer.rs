//! Reliable, backpressure-aware packet writer.
//!
//! The transport only accepts as many bytes as its send window allows and may
//! stall for long periods. [`ReliableWriter`] pushes a whole encoded packet
//! through it in capacity-sized chunks:
//!
//! ```text
//! ┌──────────────┐  chunk = min(capacity, remaining)  ┌───────────┐
//! │ PendingWrite │ ─────────────────────────────────► │ Transport │
//! └──────────────┘ ◄───────── accepted bytes ──────── └───────────┘
//!        │
//!        └─ nothing accepted: wait for a transport event, the close
//!           handle, or the retry tick, whichever comes first
//! ```
//!
//! A write ends when every byte is accepted, when the connection closes, or
//! when no byte has been accepted for `ack_timeout`. Taking both the writer
//! and the transport by `&mut` means a second write on the same connection
//! cannot start while one is in flight.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::backpressure::{ProgressDeadline, DEFAULT_ACK_TIMEOUT, DEFAULT_RETRY_TICK};
use crate::error::{DoorbellError, Result};
use crate::protocol::Packet;
use crate::transport::Transport;

/// Configuration for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum time without accepted bytes before a write is abandoned.
    pub ack_timeout: Duration,
    /// Wait between capacity checks when no event arrives.
    pub retry_tick: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_tick: DEFAULT_RETRY_TICK,
        }
    }
}

/// How a write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was accepted.
    Complete,
    /// The connection closed (or was closed) first.
    Closed,
    /// No progress for `ack_timeout`.
    TimedOut,
}

/// Outcome of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Bytes accepted by the transport.
    pub written: usize,
    /// Bytes the write was asked to deliver.
    pub total: usize,
    pub status: WriteStatus,
}

impl WriteReport {
    /// Check if every byte was delivered.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.status == WriteStatus::Complete
    }

    /// Convert a partial write into [`DoorbellError::WriteIncomplete`].
    pub fn into_result(self) -> Result<usize> {
        if self.is_complete() {
            Ok(self.written)
        } else {
            Err(DoorbellError::WriteIncomplete {
                written: self.written,
                total: self.total,
            })
        }
    }
}

/// Counters kept across writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Writes that completed.
    pub packets_sent: u64,
    /// Bytes accepted, complete or not.
    pub bytes_sent: u64,
    /// Writes that ended closed or timed out.
    pub failed_writes: u64,
}

/// The buffer of the write currently in flight.
#[derive(Debug)]
pub struct PendingWrite {
    data: Bytes,
    written: usize,
    started: Instant,
}

impl PendingWrite {
    /// Take ownership of the bytes to send.
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            written: 0,
            started: Instant::now(),
        }
    }

    /// Total bytes to send.
    #[inline]
    pub fn total(&self) -> usize {
        self.data.len()
    }

    /// Bytes accepted so far.
    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Bytes still to send.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.written
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.written == self.data.len()
    }

    /// Next `len` unsent bytes.
    pub fn next_chunk(&self, len: usize) -> &[u8] {
        let end = (self.written + len).min(self.data.len());
        &self.data[self.written..end]
    }

    /// Record accepted bytes.
    pub fn advance(&mut self, accepted: usize) {
        self.written = (self.written + accepted).min(self.data.len());
    }

    /// Time since the write started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Chunked writer with an idle-progress timeout.
#[derive(Debug, Default)]
pub struct ReliableWriter {
    config: WriterConfig,
    stats: WriterStats,
}

impl ReliableWriter {
    /// Create a writer.
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            stats: WriterStats::default(),
        }
    }

    /// Writer configuration.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Counters since creation.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Encode and write a packet.
    pub async fn write_packet<T>(
        &mut self,
        transport: &mut T,
        packet: &Packet,
        close: &CancellationToken,
    ) -> Result<WriteReport>
    where
        T: Transport + ?Sized,
    {
        let encoded = packet.encode()?;
        Ok(self.write(transport, encoded, close).await)
    }

    /// Write `data` in full, or report how far it got.
    ///
    /// Cancelling `close` ends the write at the next check with
    /// [`WriteStatus::Closed`].
    pub async fn write<T>(
        &mut self,
        transport: &mut T,
        data: Bytes,
        close: &CancellationToken,
    ) -> WriteReport
    where
        T: Transport + ?Sized,
    {
        let mut pending = PendingWrite::new(data);
        let mut deadline = ProgressDeadline::start(self.config.ack_timeout);

        let status = loop {
            if pending.is_complete() {
                break WriteStatus::Complete;
            }
            if close.is_cancelled() || transport.is_closed() {
                break WriteStatus::Closed;
            }

            let chunk = transport.send_capacity().min(pending.remaining());
            if chunk > 0 {
                let accepted = transport.try_send(pending.next_chunk(chunk));
                if accepted > 0 {
                    pending.advance(accepted);
                    deadline.record_progress();
                    trace!(
                        accepted,
                        requested = chunk,
                        written = pending.written(),
                        total = pending.total(),
                        "Chunk accepted"
                    );
                    continue;
                }
            }

            if deadline.is_expired() {
                break WriteStatus::TimedOut;
            }

            let tick = self.config.retry_tick.min(deadline.remaining());
            tokio::select! {
                _ = close.cancelled() => {}
                _ = transport.wait_event() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        };

        let report = WriteReport {
            written: pending.written(),
            total: pending.total(),
            status,
        };

        self.stats.bytes_sent += report.written as u64;
        if report.is_complete() {
            self.stats.packets_sent += 1;
        } else {
            self.stats.failed_writes += 1;
            warn!(
                transport = transport.name(),
                written = report.written,
                total = report.total,
                status = ?report.status,
                elapsed_ms = pending.elapsed().as_millis() as u64,
                "Write incomplete"
            );
        }

        report
    }
}
