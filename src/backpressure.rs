//! Backpressure handling for write operations.
//!
//! The device's network stack only buffers a few kilobytes of unacknowledged
//! data. This module provides the two pieces the writer needs to cope with
//! that:
//!
//! - [`SendWindow`]: accounting for bytes handed to the transport but not yet
//!   acknowledged, bounded by the send buffer size.
//! - [`ProgressDeadline`]: an idle timer that only fires when no bytes were
//!   accepted for a whole `ack_timeout`, however long the total write takes.
//!
//! # Configuration
//!
//! - `ack_timeout`: maximum time without progress (default: 3s)
//! - `retry_tick`: wait between capacity checks when nothing else wakes the
//!   writer (default: 1ms)
//! - `send_buffer_size`: bytes in flight before the window is full (default: 5744)

use std::time::Duration;

use tokio::time::Instant;

/// Default time a write may go without progress before it is abandoned.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(3000);

/// Default interval between capacity checks while the transport is stalled.
pub const DEFAULT_RETRY_TICK: Duration = Duration::from_millis(1);

/// Default transport send buffer size (lwIP `TCP_SND_BUF` on the device).
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 5744;

/// Bounded count of bytes sent but not yet acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    capacity: usize,
    in_flight: usize,
}

impl SendWindow {
    /// Create an empty window holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_flight: 0,
        }
    }

    /// Bytes that can be handed to the transport right now.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight)
    }

    /// Check if the window is full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.available() == 0
    }

    /// Bytes currently awaiting acknowledgement.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Maximum bytes in flight.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve up to `len` bytes. Returns how many were reserved.
    pub fn reserve(&mut self, len: usize) -> usize {
        let accepted = len.min(self.available());
        self.in_flight += accepted;
        accepted
    }

    /// Release `len` acknowledged bytes.
    pub fn release(&mut self, len: usize) {
        self.in_flight = self.in_flight.saturating_sub(len);
    }

    /// Forget everything in flight (connection dropped).
    pub fn reset(&mut self) {
        self.in_flight = 0;
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_BUFFER_SIZE)
    }
}

/// Idle timer reset by every bit of progress.
///
/// Uses `tokio::time::Instant` so paused-clock tests can drive it.
#[derive(Debug, Clone, Copy)]
pub struct ProgressDeadline {
    timeout: Duration,
    last_progress: Instant,
}

impl ProgressDeadline {
    /// Start the clock now.
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: Instant::now(),
        }
    }

    /// Record progress, restarting the idle clock.
    #[inline]
    pub fn record_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    /// Time since the last progress.
    #[inline]
    pub fn idle(&self) -> Duration {
        self.last_progress.elapsed()
    }

    /// Check if the idle time has reached the timeout.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.idle() >= self.timeout
    }

    /// Time left before expiry (zero once expired).
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.idle())
    }

    /// Configured timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_defaults() {
        let window = SendWindow::default();
        assert_eq!(window.capacity(), DEFAULT_SEND_BUFFER_SIZE);
        assert_eq!(window.available(), DEFAULT_SEND_BUFFER_SIZE);
        assert!(!window.is_full());
    }

    #[test]
    fn test_window_reserve_is_bounded() {
        let mut window = SendWindow::new(10);

        assert_eq!(window.reserve(4), 4);
        assert_eq!(window.reserve(100), 6);
        assert!(window.is_full());
        assert_eq!(window.reserve(1), 0);
        assert_eq!(window.in_flight(), 10);
    }

    #[test]
    fn test_window_release() {
        let mut window = SendWindow::new(10);
        window.reserve(10);

        window.release(3);
        assert_eq!(window.available(), 3);

        // Over-release saturates instead of underflowing.
        window.release(100);
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_window_reset() {
        let mut window = SendWindow::new(10);
        window.reserve(7);
        window.reset();
        assert_eq!(window.available(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires_without_progress() {
        let deadline = ProgressDeadline::start(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_progress_restarts_clock() {
        let mut deadline = ProgressDeadline::start(Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(80)).await;
        deadline.record_progress();
        tokio::time::advance(Duration::from_millis(80)).await;

        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::from_millis(20));
    }
}
