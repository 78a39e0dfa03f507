//! In-process lifecycle event fan-out
//!
//! The dispatcher delivers engine events to subscribed sinks, either inline
//! with the tick (synchronous mode) or buffered and drained after the tick
//! commits (queued mode). Delivery is at-most-once per subscriber per
//! event; a panicking subscriber is isolated and never affects engine
//! progress.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use flowmonkey_core::EngineEvent;

/// A lifecycle event subscriber
pub trait EventSink: Send + Sync {
    /// Receive one event; exceptions are captured and logged
    fn on_event(&self, event: &EngineEvent);
}

/// When events reach subscribers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver inline as events are emitted
    Sync,

    /// Buffer and deliver on [`EventDispatcher::drain`], after commit
    #[default]
    Queued,
}

/// In-process event dispatcher
pub struct EventDispatcher {
    mode: DeliveryMode,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    queue: Mutex<VecDeque<EngineEvent>>,
}

impl EventDispatcher {
    /// Create a dispatcher in the given mode
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            sinks: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// The configured delivery mode
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Subscribe a sink
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Emit one event
    pub fn emit(&self, event: EngineEvent) {
        match self.mode {
            DeliveryMode::Sync => self.deliver(&event),
            DeliveryMode::Queued => self.queue.lock().push_back(event),
        }
    }

    /// Deliver everything buffered in queued mode
    ///
    /// The engine calls this after a tick's state is committed, so queued
    /// subscribers never observe uncommitted transitions.
    pub fn drain(&self) {
        loop {
            let Some(event) = self.queue.lock().pop_front() else {
                return;
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &EngineEvent) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            let result = catch_unwind(AssertUnwindSafe(|| sink.on_event(event)));
            if result.is_err() {
                warn!(event_type = event.event_type(), "event sink panicked");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DeliveryMode::default())
    }
}

/// A sink that records every delivered event (for observers and tests)
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything delivered so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Dotted type names of everything delivered so far
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }

    /// Number of delivered events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was delivered
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}
