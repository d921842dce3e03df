// Sampling events emitted while the block graph is discovered.
// Observers are optional; nothing in the engine depends on them.

use crate::block::Uid;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted {
        disks: usize,
    },
    DiskScanned {
        index: usize,
        name: String,
        uid: Uid,
    },
    BlockDiscovered {
        uid: Uid,
        parent: Uid,
        block_type: String,
        decoder: String,
    },
    DecoderFailed {
        uid: Uid,
        decoder: String,
        error: String,
    },
    PassCompleted {
        pass: usize,
        new_blocks: usize,
    },
    ScanFinished {
        blocks: usize,
        passes: usize,
    },
    RootEntryMounted {
        name: String,
        uid: Uid,
    },
}

/// Receiver of scan events
pub trait EventSink: Send + Sync {
    fn sample(&self, event: &ScanEvent);
}

/// Sink logging every event at debug level
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn sample(&self, event: &ScanEvent) {
        tracing::debug!(?event, "scan event");
    }
}

/// Function-based sink
pub struct FnSink<F>
where
    F: Fn(&ScanEvent) + Send + Sync,
{
    callback: F,
}

impl<F> FnSink<F>
where
    F: Fn(&ScanEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> EventSink for FnSink<F>
where
    F: Fn(&ScanEvent) + Send + Sync,
{
    fn sample(&self, event: &ScanEvent) {
        (self.callback)(event)
    }
}

/// Fan-out to the subscribed sinks
#[derive(Default)]
pub struct EventBus {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn emit(&self, event: ScanEvent) {
        let Ok(sinks) = self.sinks.read() else {
            return;
        };
        if sinks.is_empty() {
            trace!(?event, "no subscribers");
            return;
        }
        for sink in sinks.iter() {
            sink.sample(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.emit(ScanEvent::ScanStarted { disks: 1 });
    }

    #[test]
    fn test_fan_out() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.subscribe(Arc::new(FnSink::new(move |e: &ScanEvent| {
                seen.lock().unwrap().push(e.clone());
            })));
        }
        bus.emit(ScanEvent::PassCompleted { pass: 1, new_blocks: 3 });
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
