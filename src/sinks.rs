//! Event sinks.
//!
//! The collector is sink-agnostic: workers hand every decoded event to an
//! [`EventSink`]. The console sink writes one JSON object per line.

use std::io::Write;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::error;

use crate::event::LogEvent;

pub trait EventSink: Send + Sync {
    fn deliver(&self, event: LogEvent);
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Stdout,
    Stderr,
}

pub struct ConsoleSink {
    target: Target,
}

impl ConsoleSink {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

impl EventSink for ConsoleSink {
    fn deliver(&self, event: LogEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(error) => {
                error!(message = "Unable to serialize event.", %error);
                return;
            }
        };

        let result = match self.target {
            Target::Stdout => writeln!(std::io::stdout().lock(), "{line}"),
            Target::Stderr => writeln!(std::io::stderr().lock(), "{line}"),
        };
        if let Err(error) = result {
            error!(message = "Unable to write event.", %error);
        }
    }
}

/// Accumulates events in memory. Used by tests that need to observe the
/// collector's output.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn deliver(&self, event: LogEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_accumulates() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        let mut event = LogEvent::default();
        event.insert("host", "10.0.0.1");
        sink.deliver(event.clone());
        sink.deliver(event);

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events()[0].get("host").unwrap().as_str(), Some("10.0.0.1"));
    }
}
