//! Request log events and the sinks that receive them
//!
//! The proxy emits exactly one [`LogEvent`] per handled request, success or
//! failure. Consumers subscribe by handing the engine a [`LogSink`]: the
//! bounded [`RequestLog`], a [`ChannelSink`] drained elsewhere, or any
//! `Fn(LogEvent)` closure.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Number of entries kept by a [`RequestLog`] created with [`RequestLog::new`]
pub const DEFAULT_LOG_CAPACITY: usize = 100;

const DISPLAY_PATH_WIDTH: usize = 40;

/// One completed request as seen by the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub method: String,
    /// Path and query string exactly as received
    pub path: String,
    pub status_code: u16,
}

impl LogEvent {
    pub fn new(timestamp: DateTime<Local>, method: &str, path: &str, status_code: u16) -> Self {
        Self {
            timestamp,
            method: method.to_string(),
            path: path.to_string(),
            status_code,
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.chars().count() > DISPLAY_PATH_WIDTH {
            let head: String = self.path.chars().take(DISPLAY_PATH_WIDTH - 3).collect();
            format!("{}...", head)
        } else {
            self.path.clone()
        };

        write!(
            f,
            "{} {:<6} {:<40} {}",
            self.timestamp.format("%H:%M:%S"),
            self.method,
            path,
            self.status_code
        )
    }
}

/// Receiver of request log events.
///
/// Called from whichever task handled the request. Implementations do their
/// own synchronisation and must not panic or block for long.
pub trait LogSink: Send + Sync {
    fn record(&self, event: LogEvent);
}

impl<F> LogSink for F
where
    F: Fn(LogEvent) + Send + Sync,
{
    fn record(&self, event: LogEvent) {
        self(event)
    }
}

/// Bounded, newest-first request log
pub struct RequestLog {
    entries: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Snapshot of the log, newest entry first
    pub fn entries(&self) -> Vec<LogEvent> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for RequestLog {
    fn record(&self, event: LogEvent) {
        let mut entries = self.entries.lock();
        entries.push_front(event);
        entries.truncate(self.capacity);
    }
}

/// Forwards events into an unbounded channel.
///
/// Recording never blocks the request and never loses an event while the
/// receiver is alive. Events are dropped only once the receiver is gone.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<LogEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<LogEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with the receiving half of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl LogSink for ChannelSink {
    fn record(&self, event: LogEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("Request log receiver closed; dropping {}", e.0.path);
        }
    }
}
