// In-process backends for every remote seam. Used by the integration
// tests and by sessions that run without a server.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{BlobStore, DataService, Filter, IdentityProvider, Table, TelemetrySink, WorkflowEndpoint};
use crate::errors::RemoteError;
use crate::lifecycle::Actor;
use crate::queue::QueuedEvent;
use crate::realtime::{ChangeEvent, ChangeKind, RealtimeTransport, ResourceId, TransportChannel, TransportMessage};

/// A panicked holder leaves the data usable; every guard here is short-lived
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Tables held in memory with injectable failures and latency
#[derive(Default)]
pub struct MemoryDataService {
    tables: Mutex<HashMap<Table, Vec<Value>>>,
    failures: Mutex<HashMap<Table, VecDeque<RemoteError>>>,
    latency: Mutex<Option<Duration>>,
    slow_ack: Mutex<Option<Duration>>,
    feed: Option<Arc<MemoryTransport>>,
    selects: AtomicUsize,
    inserts: AtomicUsize,
    updates: AtomicUsize,
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish inserts and updates to channels opened on `transport`
    pub fn with_change_feed(transport: Arc<MemoryTransport>) -> Self {
        Self {
            feed: Some(transport),
            ..Self::default()
        }
    }

    pub fn seed(&self, table: Table, rows: Vec<Value>) {
        lock(&self.tables).entry(table).or_default().extend(rows);
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        lock(&self.tables).get(&table).cloned().unwrap_or_default()
    }

    /// Queue an error for the next call touching `table`
    pub fn fail_next(&self, table: Table, error: RemoteError) {
        lock(&self.failures).entry(table).or_default().push_back(error);
    }

    /// Delay every call before it reaches the tables
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Apply the next update, then hold its response for `delay`
    pub fn delay_next_update_ack(&self, delay: Duration) {
        *lock(&self.slow_ack) = Some(delay);
    }

    pub fn select_calls(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    async fn enter(&self, table: Table) -> Result<(), RemoteError> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.failures).get_mut(&table).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<Value>, RemoteError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        self.enter(table).await?;
        Ok(lock(&self.tables)
            .get(&table)
            .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, mut row: Value) -> Result<Value, RemoteError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.enter(table).await?;

        let existing = row_id(&row);
        let Some(fields) = row.as_object_mut() else {
            return Err(RemoteError::Validation(format!("{table} rows must be objects")));
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                fields.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        {
            let mut tables = lock(&self.tables);
            let rows = tables.entry(table).or_default();
            if rows.iter().any(|existing| row_id(existing).as_deref() == Some(id.as_str())) {
                return Err(RemoteError::Validation(format!(
                    "duplicate key value violates unique constraint on {table}.id ({id})"
                )));
            }
            rows.push(row.clone());
        }

        if let Some(feed) = &self.feed {
            feed.publish_row(table, ChangeEvent::insert(id, row.clone()));
        }
        Ok(row)
    }

    async fn update(
        &self,
        table: Table,
        filter: &Filter,
        patch: Value,
    ) -> Result<Vec<Value>, RemoteError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.enter(table).await?;

        let Value::Object(patch) = patch else {
            return Err(RemoteError::Validation("patch must be an object".to_string()));
        };

        let updated: Vec<Value> = {
            let mut tables = lock(&self.tables);
            let rows = tables.entry(table).or_default();
            rows.iter_mut()
                .filter(|row| filter.matches(row))
                .map(|row| {
                    merge(row, &patch);
                    row.clone()
                })
                .collect()
        };

        if let Some(feed) = &self.feed {
            for row in &updated {
                let id = format!("{}:{}", row_id(row).unwrap_or_default(), Uuid::new_v4());
                feed.publish_row(table, ChangeEvent::new(id, ChangeKind::Update, row.clone()));
            }
        }

        let slow_ack = lock(&self.slow_ack).take();
        if let Some(delay) = slow_ack {
            tokio::time::sleep(delay).await;
        }
        Ok(updated)
    }
}

fn merge(row: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(fields) = row {
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
    }
}

struct OpenChannel {
    resource: ResourceId,
    sender: mpsc::UnboundedSender<TransportMessage>,
}

/// Push transport backed by in-process channels.
///
/// Every event pushed for a resource is kept so a reopen can replay after
/// `resume_from` when resumption is enabled.
#[derive(Default)]
pub struct MemoryTransport {
    channels: Mutex<HashMap<String, OpenChannel>>,
    history: Mutex<HashMap<ResourceId, Vec<ChangeEvent>>>,
    resume_supported: AtomicBool,
    failing_opens: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    resume_requests: Mutex<Vec<Option<String>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resume_supported(&self, supported: bool) {
        self.resume_supported.store(supported, Ordering::SeqCst);
    }

    /// Make the next `count` opens fail with a network error
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next open wait `delay` before answering
    pub fn delay_next_open(&self, delay: Duration) {
        *lock(&self.open_delay) = Some(delay);
    }

    /// Deliver `event` to every open channel on `resource`
    pub fn push(&self, resource: &ResourceId, event: ChangeEvent) {
        lock(&self.history)
            .entry(resource.clone())
            .or_default()
            .push(event.clone());

        let channels = lock(&self.channels);
        for channel in channels.values().filter(|c| &c.resource == resource) {
            let _ = channel
                .sender
                .unbounded_send(TransportMessage::Event(event.clone()));
        }
    }

    /// Route a row change to every known resource whose filter it satisfies
    pub fn publish_row(&self, table: Table, event: ChangeEvent) {
        let resources: HashSet<ResourceId> = lock(&self.history)
            .keys()
            .filter(|resource| resource.table == table && resource.filter.matches(&event.record))
            .cloned()
            .collect();
        for resource in resources {
            self.push(&resource, event.clone());
        }
    }

    /// Drop every channel on `resource` with a transport error; returns how many
    pub fn disconnect(&self, resource: &ResourceId) -> usize {
        let mut channels = lock(&self.channels);
        let dropped: Vec<String> = channels
            .iter()
            .filter(|(_, channel)| &channel.resource == resource)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dropped {
            if let Some(channel) = channels.remove(id) {
                let _ = channel
                    .sender
                    .unbounded_send(TransportMessage::Error("connection lost".to_string()));
            }
        }
        dropped.len()
    }

    pub fn open_channels(&self, resource: &ResourceId) -> usize {
        lock(&self.channels)
            .values()
            .filter(|channel| &channel.resource == resource)
            .count()
    }

    pub fn open_calls(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// `resume_from` of every open request, in order
    pub fn resume_requests(&self) -> Vec<Option<String>> {
        lock(&self.resume_requests).clone()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn open(
        &self,
        resource: &ResourceId,
        resume_from: Option<String>,
    ) -> Result<TransportChannel, RemoteError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        lock(&self.resume_requests).push(resume_from.clone());

        let delay = lock(&self.open_delay).take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(RemoteError::Network("realtime endpoint unreachable".to_string()));
        }

        let (sender, receiver) = mpsc::unbounded();
        let mut resumed = false;
        {
            let mut history = lock(&self.history);
            let events = history.entry(resource.clone()).or_default();
            let replay_from = resume_from
                .as_deref()
                .filter(|_| self.resume_supported.load(Ordering::SeqCst))
                .and_then(|id| events.iter().position(|event| event.id == id));
            if let Some(position) = replay_from {
                resumed = true;
                for event in &events[position + 1..] {
                    let _ = sender.unbounded_send(TransportMessage::Event(event.clone()));
                }
            }
        }

        let channel_id = Uuid::new_v4().to_string();
        lock(&self.channels).insert(
            channel_id.clone(),
            OpenChannel {
                resource: resource.clone(),
                sender,
            },
        );
        debug!(%resource, %channel_id, resumed, "Memory transport opened channel");

        Ok(TransportChannel {
            channel_id,
            resumed,
            messages: receiver.boxed(),
        })
    }

    async fn close(&self, channel_id: &str) -> Result<(), RemoteError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(channel) = lock(&self.channels).remove(channel_id) {
            let _ = channel.sender.unbounded_send(TransportMessage::Closed);
        }
        Ok(())
    }
}

/// Telemetry sink that can be taken offline
pub struct MemoryTelemetrySink {
    reachable: AtomicBool,
    deleted_subjects: Mutex<HashSet<String>>,
    received: Mutex<Vec<QueuedEvent>>,
    batches: AtomicUsize,
    attempts: AtomicUsize,
}

impl Default for MemoryTelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            deleted_subjects: Mutex::new(HashSet::new()),
            received: Mutex::new(Vec::new()),
            batches: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn delete_subject(&self, subject_id: &str) {
        lock(&self.deleted_subjects).insert(subject_id.to_string());
    }

    pub fn received(&self) -> Vec<QueuedEvent> {
        lock(&self.received).clone()
    }

    /// Batches accepted
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Send calls, accepted or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("telemetry sink unreachable".to_string()))
        }
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetrySink {
    async fn send_batch(&self, events: &[QueuedEvent]) -> Result<(), RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        lock(&self.received).extend_from_slice(events);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subject_exists(&self, subject_id: &str) -> Result<bool, RemoteError> {
        self.check_reachable()?;
        Ok(!lock(&self.deleted_subjects).contains(subject_id))
    }
}

/// Identity fixed at construction
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    actor: Option<Actor>,
}

impl StaticIdentity {
    pub fn new(actor: Actor) -> Self {
        Self { actor: Some(actor) }
    }

    pub fn anonymous() -> Self {
        Self { actor: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_actor(&self) -> Result<Option<Actor>, RemoteError> {
        Ok(self.actor.clone())
    }
}

/// Records workflow invocations; optionally fails them all
#[derive(Default)]
pub struct MemoryWorkflow {
    invocations: Mutex<Vec<(String, Value)>>,
    failure: Mutex<Option<RemoteError>>,
}

impl MemoryWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: RemoteError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        lock(&self.invocations).clone()
    }
}

#[async_trait]
impl WorkflowEndpoint for MemoryWorkflow {
    async fn invoke(&self, workflow: &str, payload: Value) -> Result<Value, RemoteError> {
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        lock(&self.invocations).push((workflow.to_string(), payload));
        Ok(Value::Object(Map::new()))
    }
}

/// Bucketed object storage held in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<(Vec<u8>, String)> {
        lock(&self.objects)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        lock(&self.objects).insert(
            (bucket.to_string(), path.to_string()),
            (bytes, content_type.to_string()),
        );
        Ok(path.to_string())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        expires_in_secs: u64,
    ) -> Result<String, RemoteError> {
        if self.object(bucket, path).is_none() {
            return Err(RemoteError::NotFound(format!("{bucket}/{path}")));
        }
        Ok(format!("memory://{bucket}/{path}?expires_in={expires_in_secs}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id_and_rejects_duplicates() {
        let data = MemoryDataService::new();
        let stored = data
            .insert(Table::ChatMessages, json!({"text": "hi"}))
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        let err = data
            .insert(Table::ChatMessages, json!({"id": id, "text": "again"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
        assert_eq!(data.rows(Table::ChatMessages).len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_matching_rows_only() {
        let data = MemoryDataService::new();
        data.seed(
            Table::Tasks,
            vec![
                json!({"id": "1", "status": "pending"}),
                json!({"id": "2", "status": "pending"}),
            ],
        );

        let updated = data
            .update(
                Table::Tasks,
                &Filter::new().eq("id", "1").eq("status", "pending"),
                json!({"status": "in_progress"}),
            )
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["status"], "in_progress");

        let rows = data.rows(Table::Tasks);
        assert_eq!(rows[1]["status"], "pending");
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let data = MemoryDataService::new();
        data.fail_next(Table::Tasks, RemoteError::Network("reset".into()));

        assert!(data.select(Table::Tasks, &Filter::new()).await.is_err());
        assert!(data.select(Table::Tasks, &Filter::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_replays_after_resume_point() {
        let transport = MemoryTransport::new();
        transport.set_resume_supported(true);
        let resource = ResourceId::task_chat("7");

        let first = transport.open(&resource, None).await.unwrap();
        assert!(!first.resumed);
        for id in ["a", "b", "c"] {
            transport.push(&resource, ChangeEvent::insert(id, json!({"id": id})));
        }
        transport.disconnect(&resource);

        let mut reopened = transport.open(&resource, Some("a".into())).await.unwrap();
        assert!(reopened.resumed);
        let mut replayed = Vec::new();
        for _ in 0..2 {
            match reopened.messages.next().await {
                Some(TransportMessage::Event(event)) => replayed.push(event.id),
                other => panic!("expected a replayed event, got {other:?}"),
            }
        }
        assert_eq!(replayed, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_sink_offline_rejects_sends() {
        let sink = MemoryTelemetrySink::new();
        sink.set_reachable(false);
        let event = QueuedEvent::new("opened", json!({}), "s");

        assert!(sink.send_batch(&[event.clone()]).await.is_err());
        sink.set_reachable(true);
        sink.send_batch(&[event]).await.unwrap();
        assert_eq!(sink.batches(), 1);
        assert_eq!(sink.attempts(), 2);
    }
}
