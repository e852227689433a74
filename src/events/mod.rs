//! In-process event bus
//!
//! Fan-out of state changes to push subscribers. Delivery is best-effort:
//! the broadcast channel never blocks a sender, lagging receivers skip
//! ahead, and dropped receivers disappear on their own.

use crate::jobs::RecordingJob;
use crate::metrics::{MetricsSnapshot, ScalingRecommendation};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Subscription classes offered on the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Metrics,
    Recordings,
    Scaling,
}

/// A state change published to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Metrics { snapshot: MetricsSnapshot },
    Recording { job: RecordingJob },
    Scaling { recommendations: Vec<ScalingRecommendation> },
}

impl Event {
    pub fn class(&self) -> EventClass {
        match self {
            Event::Metrics { .. } => EventClass::Metrics,
            Event::Recording { .. } => EventClass::Recordings,
            Event::Scaling { .. } => EventClass::Scaling,
        }
    }
}

/// Broadcast-backed fan-out of orchestrator events
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber backlog capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all subscribers. Returns how many received it; zero
    /// subscribers is not an error.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to the raw event stream. Callers filter by
    /// [`Event::class`] themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
