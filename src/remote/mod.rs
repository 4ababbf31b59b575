// Seams to the external collaborators the core talks to.
// Everything behind these traits is reached through the RequestExecutor.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::errors::RemoteError;
use crate::lifecycle::Actor;
use crate::queue::QueuedEvent;

/// Tables of the remote relational data service used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tasks,
    TaskStatusHistory,
    ChatMessages,
    Notifications,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Tasks => "tasks",
            Table::TaskStatusHistory => "task_status_history",
            Table::ChatMessages => "chat_messages",
            Table::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conjunction of column equality predicates, e.g. `task_id=eq.42&status=eq.pending`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, String)] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether a row satisfies every predicate. Non-string cells compare by
    /// their JSON rendering, so `eq("priority", "2")` matches `2`.
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|(column, expected)| match row.get(column) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .conditions
            .iter()
            .map(|(column, value)| format!("{column}=eq.{value}"))
            .collect();
        f.write_str(&rendered.join("&"))
    }
}

/// Row-oriented CRUD against the remote data service
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait DataService: Send + Sync {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, RemoteError>;

    /// Insert one row and return it as stored (server defaults applied)
    async fn insert(&self, table: Table, row: Value) -> Result<Value, RemoteError>;

    /// Merge `patch` into every row matching `filter`; returns the updated rows
    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError>;
}

/// Current session identity, consumed read-only
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_actor(&self) -> Result<Option<Actor>, RemoteError>;
}

/// Opaque workflow-automation endpoint (confirmation emails and similar fan-out)
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkflowEndpoint: Send + Sync {
    async fn invoke(&self, workflow: &str, payload: Value) -> Result<Value, RemoteError>;
}

/// Blob storage used by attachment flows
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return the object path
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError>;

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        expires_in_secs: u64,
    ) -> Result<String, RemoteError>;
}

/// Remote sink for best-effort telemetry
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_batch(&self, events: &[QueuedEvent]) -> Result<(), RemoteError>;

    /// Whether the entity an event refers to still exists upstream
    async fn subject_exists(&self, subject_id: &str) -> Result<bool, RemoteError>;
}
