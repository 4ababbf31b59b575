use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A telemetry event waiting in the durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Local identity, also lets the sink discard a resent batch
    pub id: String,
    pub name: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
    /// Entity the event refers to; verified upstream before sending
    pub subject_id: Option<String>,
    pub session_id: String,
}

impl QueuedEvent {
    pub fn new(name: impl Into<String>, properties: Value, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            properties,
            timestamp: Utc::now(),
            subject_id: None,
            session_id: session_id.into(),
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }
}

/// Outcome of one `flush` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushResult {
    /// Nothing was queued
    Empty,
    /// The batch reached the sink and was removed from the queue
    Sent { sent: usize, dropped: usize },
    /// The sink was unreachable; `retained` events stay queued
    Failed {
        retained: usize,
        dropped: usize,
        error: String,
    },
    /// Another flush owns the batch; this call did nothing
    AlreadyRunning,
}

impl FlushResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FlushResult::Empty | FlushResult::Sent { .. })
    }
}
