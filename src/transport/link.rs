//! Event-applied state shared by the transport implementations.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::TransportEvent;
use crate::backpressure::SendWindow;

/// Connection-side view of a stream whose I/O runs elsewhere.
///
/// Holds the event receiver and the state those events update: received
/// bytes, the send window, and whether the stream is open.
#[derive(Debug)]
pub(crate) struct EventLink {
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    inbound: BytesMut,
    window: SendWindow,
    open: bool,
}

impl EventLink {
    pub(crate) fn new(send_buffer_size: usize) -> Self {
        Self {
            events: None,
            inbound: BytesMut::new(),
            window: SendWindow::new(send_buffer_size),
            open: false,
        }
    }

    /// Start consuming events of a freshly opened stream.
    pub(crate) fn attach(&mut self, events: mpsc::UnboundedReceiver<TransportEvent>) {
        self.reset();
        self.events = Some(events);
        self.open = true;
    }

    pub(crate) fn apply(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected => self.open = true,
            TransportEvent::DataReceived(data) => self.inbound.extend_from_slice(data),
            TransportEvent::SendCompleted(n) => self.window.release(*n),
            TransportEvent::Closed => {
                self.open = false;
                self.window.reset();
            }
        }
    }

    /// Apply every event already queued.
    pub(crate) fn drain(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };

        let mut drained = Vec::new();
        let mut disconnected = false;
        loop {
            match events.try_recv() {
                Ok(event) => drained.push(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        for event in &drained {
            self.apply(event);
        }
        if disconnected {
            self.open = false;
            self.events = None;
        }
    }

    /// Wait for the next event and apply it.
    pub(crate) async fn next(&mut self) -> Option<TransportEvent> {
        let events = self.events.as_mut()?;
        match events.recv().await {
            Some(event) => {
                self.apply(&event);
                Some(event)
            }
            None => {
                self.open = false;
                self.events = None;
                None
            }
        }
    }

    pub(crate) fn available(&mut self) -> usize {
        self.drain();
        self.inbound.len()
    }

    pub(crate) fn take(&mut self, max: usize) -> Bytes {
        self.drain();
        let n = max.min(self.inbound.len());
        self.inbound.split_to(n).freeze()
    }

    pub(crate) fn capacity(&mut self) -> usize {
        self.drain();
        if self.open {
            self.window.available()
        } else {
            0
        }
    }

    /// Reserve window space for bytes about to be sent.
    pub(crate) fn reserve(&mut self, len: usize) -> usize {
        self.window.reserve(len)
    }

    pub(crate) fn is_closed(&mut self) -> bool {
        self.drain();
        !self.open
    }

    /// Mark the stream closed without waiting for its event.
    pub(crate) fn mark_closed(&mut self) {
        self.apply(&TransportEvent::Closed);
    }

    /// Forget the stream entirely.
    pub(crate) fn reset(&mut self) {
        self.events = None;
        self.inbound.clear();
        self.window.reset();
        self.open = false;
    }
}
