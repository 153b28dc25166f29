//! Human-readable progress messages flowing from the upload worker to
//! whatever front end is draining them.
//!
//! The queue is unbounded: a slow consumer makes it grow, it never drops.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Producer side; cheap to clone into background tasks.
#[derive(Clone)]
pub struct EventSink {
    tx: UnboundedSender<LogEvent>,
}

impl EventSink {
    pub fn emit(&self, message: impl Into<String>) {
        let event = LogEvent::new(message);
        debug!(event = %event.message, "log event");
        if self.tx.send(event).is_err() {
            debug!("event stream closed, message discarded");
        }
    }
}

/// Consumer side, owned by the foreground.
pub struct EventStream {
    rx: UnboundedReceiver<LogEvent>,
}

impl EventStream {
    /// Everything queued so far, in arrival order. Never blocks.
    pub fn drain(&mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Waits for the next event; `None` once every sink is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }
}

pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}
