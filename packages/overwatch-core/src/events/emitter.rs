//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than on the concrete
//! event bus, enabling testing and alternative transports.

use super::RuntimeEvent;

/// Trait for emitting runtime events without knowledge of transport.
///
/// Node workers, the alarm manager, and the workflow engine use this trait
/// to emit events, decoupling them from how events reach observers.
pub trait EventEmitter: Send + Sync {
    /// Emits a runtime event.
    fn emit(&self, event: RuntimeEvent);
}

/// No-op emitter for embedded use or testing.
///
/// Events are silently discarded.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: RuntimeEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level. Useful for debugging event flow
/// or in development environments.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: RuntimeEvent) {
        tracing::debug!(?event, "runtime_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events.
    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: RuntimeEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter {
            count: AtomicUsize::new(0),
        });

        emitter.emit(RuntimeEvent::NodeStarted {
            workflow_id: "wf".to_string(),
            node_id: "n1".to_string(),
            timestamp: 0,
        });
        emitter.emit(RuntimeEvent::NodeCompleted {
            workflow_id: "wf".to_string(),
            node_id: "n1".to_string(),
            timestamp: 1,
        });

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }
}
