//! Operator notifications

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

/// Sink for operator-facing messages
pub trait Messenger: Send + Sync {
    /// Deliver `message` stamped with `at`
    fn send(&self, at: DateTime<Utc>, message: &str);
}

/// Writes messages to the log
#[derive(Debug, Default)]
pub struct LogMessenger;

impl Messenger for LogMessenger {
    fn send(&self, at: DateTime<Utc>, message: &str) {
        info!(%at, "{message}");
    }
}

/// Keeps messages in memory
#[derive(Debug, Default)]
pub struct MemoryMessenger {
    messages: Mutex<Vec<(DateTime<Utc>, String)>>,
}

impl MemoryMessenger {
    /// Messages received so far
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl Messenger for MemoryMessenger {
    fn send(&self, at: DateTime<Utc>, message: &str) {
        self.messages.lock().push((at, message.to_string()));
    }
}
