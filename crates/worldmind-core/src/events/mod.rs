//! Structured progress events.
//!
//! A broadcast-based bus with sequence numbering. Delivery is best-effort,
//! asynchronous, and never blocks the publisher; subscribers that fall
//! behind lose the oldest events (broadcast channel semantics).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Well-known event topics.
pub mod topic {
    pub const MISSION_STARTED: &str = "mission.started";
    pub const MISSION_COMPLETED: &str = "mission.completed";
    pub const NODE_ENTERED: &str = "node.entered";
    pub const NODE_EXITED: &str = "node.exited";
    pub const WAVE_SCHEDULED: &str = "wave.scheduled";
    pub const TASK_DISPATCHED: &str = "task.dispatched";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_RETRYING: &str = "task.retrying";
    pub const QUALITY_GATE_DECIDED: &str = "quality_gate.decided";
    pub const DEPLOYMENT_DIAGNOSED: &str = "deployment.diagnosed";
    pub const OSCILLATION_DETECTED: &str = "oscillation.detected";
    pub const CHECKPOINT_WRITTEN: &str = "checkpoint.written";
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionEvent {
    /// Monotonically increasing per-bus sequence number.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub mission_id: String,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
}

/// Central event bus for mission progress.
pub struct EventBus {
    sender: broadcast::Sender<MissionEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event. Never blocks; events published with no subscribers
    /// are dropped.
    pub fn publish(
        &self,
        topic: &str,
        mission_id: &str,
        task_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = MissionEvent {
            sequence,
            timestamp: Utc::now(),
            topic: topic.to_owned(),
            mission_id: mission_id.to_owned(),
            task_id: task_id.map(str::to_owned),
            payload,
        };
        let _ = self.sender.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.sender.subscribe()
    }

    /// Number of events published so far.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
