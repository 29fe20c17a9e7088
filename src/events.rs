//! Domain events emitted by the engine and by nodes.
//!
//! Events are buffered in the engine and handed to the host through
//! [`Engine::drain_events`](crate::Engine::drain_events). Hosts that prefer
//! push delivery register an [`EventSink`] instead; once a sink is registered
//! nothing is buffered. The buffer holds at most [`EventQueue::CAPACITY`]
//! events and drops the oldest beyond that.

use std::collections::VecDeque;

use log::warn;
use thiserror::Error;

use crate::error::NodeError;
use crate::node::NodeId;
use crate::port::PortValue;

/// Lifecycle phase a node failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorPhase {
    /// Construction or `start()`. The node is not scheduled until reloaded.
    Start,
    /// `render()`, `on_change()` or `on_trigger()`. Retried on dirty inputs.
    Render,
}

/// Events delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    NodeStarted {
        node: NodeId,
        definition: String,
    },
    NodeFailed {
        node: NodeId,
        phase: ErrorPhase,
        error: NodeError,
    },
    NodeRecovered {
        node: NodeId,
    },
    NodeDisposed {
        node: NodeId,
    },
    NodeReloaded {
        node: NodeId,
        definition: String,
    },
    /// A named value emitted by node code, e.g. a diagnostics overlay toggle.
    Signal {
        node: NodeId,
        name: String,
        value: PortValue,
    },
}

impl EngineEvent {
    /// The node the event is about.
    pub fn node(&self) -> NodeId {
        match self {
            EngineEvent::NodeStarted { node, .. }
            | EngineEvent::NodeFailed { node, .. }
            | EngineEvent::NodeRecovered { node }
            | EngineEvent::NodeDisposed { node }
            | EngineEvent::NodeReloaded { node, .. }
            | EngineEvent::Signal { node, .. } => *node,
        }
    }
}

/// Error when a sink could not accept an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event sink error: {message}")]
pub struct EventError {
    pub message: String,
}

impl EventError {
    pub fn closed() -> Self {
        Self {
            message: "sink closed".to_string(),
        }
    }
}

/// Push-style receiver of engine events.
pub trait EventSink {
    fn send(&self, event: &EngineEvent) -> Result<(), EventError>;
}

/// Sink that discards everything.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: &EngineEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Forwards events into a `futures` unbounded channel.
impl EventSink for futures::channel::mpsc::UnboundedSender<EngineEvent> {
    fn send(&self, event: &EngineEvent) -> Result<(), EventError> {
        self.unbounded_send(event.clone())
            .map_err(|_| EventError::closed())
    }
}

/// Buffered events plus registered sinks.
#[derive(Default)]
pub struct EventQueue {
    pending: VecDeque<EngineEvent>,
    sinks: Vec<Box<dyn EventSink>>,
    dropped: usize,
}

impl EventQueue {
    pub const CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn push(&mut self, event: EngineEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(&event) {
                warn!("dropping event for sink: {e}");
            }
        }
        if !self.sinks.is_empty() {
            return;
        }
        if self.pending.len() == Self::CAPACITY {
            if self.dropped == 0 {
                warn!(
                    "event buffer full ({} events); dropping the oldest until drained",
                    Self::CAPACITY
                );
            }
            self.pending.pop_front();
            self.dropped += 1;
        }
        self.pending.push_back(event);
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        if self.dropped > 0 {
            warn!("{} events were dropped before this drain", self.dropped);
            self.dropped = 0;
        }
        self.pending.drain(..).collect()
    }

    /// Events discarded since the last drain because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
