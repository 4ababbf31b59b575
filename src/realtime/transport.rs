// Swappable push transport behind the channel manager (socket, long-poll, in-memory)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::errors::RemoteError;
use crate::remote::{Filter, Table};

/// What a subscription listens to: one table narrowed by a filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub table: Table,
    pub filter: Filter,
}

impl ResourceId {
    pub fn new(table: Table, filter: Filter) -> Self {
        Self { table, filter }
    }

    /// Chat stream of one task
    pub fn task_chat(task_id: &str) -> Self {
        Self::new(Table::ChatMessages, Filter::new().eq("task_id", task_id))
    }

    /// Row updates of one task
    pub fn task(task_id: &str) -> Self {
        Self::new(Table::Tasks, Filter::new().eq("id", task_id))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filter.is_empty() {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{}?{}", self.table, self.filter)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    /// Row delivered by a full resync rather than the live feed
    Snapshot,
}

/// One change notification with its full row payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Deduplication key; for inserts this is the row id
    pub id: String,
    pub kind: ChangeKind,
    pub record: Value,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(id: impl Into<String>, kind: ChangeKind, record: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            record,
            received_at: Utc::now(),
        }
    }

    pub fn insert(id: impl Into<String>, record: Value) -> Self {
        Self::new(id, ChangeKind::Insert, record)
    }

    /// Build a snapshot event from a row, keyed by its `id` column
    pub fn from_snapshot_row(record: Value) -> Option<Self> {
        let id = row_id(&record)?;
        Some(Self::new(id, ChangeKind::Snapshot, record))
    }

    /// `<row id>#<content hash>`: changes whenever the row's contents change.
    ///
    /// Snapshot rows are deduplicated on this key, so an unchanged row is
    /// dropped while a row that was updated during a gap comes through.
    pub fn row_version(&self) -> Option<String> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let id = row_id(&self.record)?;
        let mut hasher = DefaultHasher::new();
        // serde_json maps are sorted, so equal rows render identically
        self.record.to_string().hash(&mut hasher);
        Some(format!("{id}#{:016x}", hasher.finish()))
    }
}

fn row_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    Event(ChangeEvent),
    Error(String),
    Closed,
}

/// An open transport-level channel
pub struct TransportChannel {
    pub channel_id: String,
    /// True when the transport replayed from the requested `resume_from` id
    pub resumed: bool,
    pub messages: BoxStream<'static, TransportMessage>,
}

impl fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportChannel")
            .field("channel_id", &self.channel_id)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a change feed for `resource`, replaying after `resume_from` when supported
    async fn open(
        &self,
        resource: &ResourceId,
        resume_from: Option<String>,
    ) -> Result<TransportChannel, RemoteError>;

    async fn close(&self, channel_id: &str) -> Result<(), RemoteError>;
}
