use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::transport::{ChangeEvent, ChangeKind, RealtimeTransport, ResourceId, TransportMessage};
use super::window::SeenWindow;
use crate::config::RealtimeConfig;
use crate::errors::{RemoteError, SyncError, SyncResult};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::remote::DataService;

/// What a subscriber receives
#[derive(Debug)]
pub enum RealtimeNotice {
    Event(ChangeEvent),
    /// Resubscription was exhausted; no further notices follow
    Error(SyncError),
}

/// One caller's claim on a shared channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    resource: ResourceId,
    subscriber_id: u64,
}

impl SubscriptionHandle {
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<RealtimeNotice>,
}

/// Snapshot of a shared channel's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub resource: ResourceId,
    pub ref_count: usize,
    pub last_seen_id: Option<String>,
    pub channel_id: String,
}

struct SharedChannel {
    channel_id: String,
    generation: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RealtimeNotice>>,
    /// Event ids already delivered
    seen: SeenWindow,
    /// Row contents already delivered; snapshot rows are checked against this
    versions: SeenWindow,
    /// Resume point: the last event that arrived over the transport
    last_seen_id: Option<String>,
    pump: Option<JoinHandle<()>>,
}

impl SharedChannel {
    fn new(channel_id: String, generation: u64, capacity: usize, ttl: Duration) -> Self {
        Self {
            channel_id,
            generation,
            subscribers: HashMap::new(),
            seen: SeenWindow::new(capacity, ttl),
            versions: SeenWindow::new(capacity, ttl),
            last_seen_id: None,
            pump: None,
        }
    }

    /// Deduplicate and fan out; returns false for a duplicate.
    ///
    /// Only events with `from_transport` move the resume point. A local echo
    /// may be ahead of server events that have not arrived yet.
    fn deliver(&mut self, event: ChangeEvent, from_transport: bool) -> bool {
        let version = event.row_version();
        if event.kind == ChangeKind::Snapshot {
            let key = version.unwrap_or_else(|| event.id.clone());
            if !self.versions.insert(&key) {
                return false;
            }
        } else {
            if !self.seen.insert(&event.id) {
                return false;
            }
            if let Some(version) = version {
                self.versions.insert(&version);
            }
            if from_transport {
                self.last_seen_id = Some(event.id.clone());
            }
        }

        for sender in self.subscribers.values() {
            // a dropped receiver still holds its reference until unsubscribe
            let _ = sender.send(RealtimeNotice::Event(event.clone()));
        }
        true
    }
}

struct Inner {
    transport: Arc<dyn RealtimeTransport>,
    snapshots: Option<Arc<dyn DataService>>,
    executor: RequestExecutor,
    resubscribe_policy: RetryPolicy,
    dedup_capacity: usize,
    dedup_ttl: Duration,
    registry: Mutex<HashMap<ResourceId, SharedChannel>>,
    /// One opener per resource; the registry is not held while a channel opens
    opening: Mutex<HashMap<ResourceId, Arc<Mutex<()>>>>,
    next_subscriber: AtomicU64,
    next_generation: AtomicU64,
}

/// Shared, reference-counted realtime subscriptions.
///
/// All subscribers of one resource share a single transport channel and a
/// single dedup window. Registry mutations are serialized by one async mutex.
#[derive(Clone)]
pub struct RealtimeChannelManager {
    inner: Arc<Inner>,
}

impl RealtimeChannelManager {
    /// `snapshots` serves full resyncs when the transport cannot resume;
    /// without it a non-resumed reconnect only logs the gap.
    pub fn new(
        executor: RequestExecutor,
        transport: Arc<dyn RealtimeTransport>,
        snapshots: Option<Arc<dyn DataService>>,
        config: &RealtimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                snapshots,
                executor,
                resubscribe_policy: RetryPolicy::from(&config.resubscribe),
                dedup_capacity: config.dedup_capacity,
                dedup_ttl: config.dedup_ttl(),
                registry: Mutex::new(HashMap::new()),
                opening: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub async fn subscribe(&self, resource: ResourceId) -> SyncResult<Subscription> {
        let subscriber_id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle {
            resource: resource.clone(),
            subscriber_id,
        };

        let Err(sender) = self.inner.try_join(&resource, subscriber_id, sender).await else {
            return Ok(Subscription { handle, events });
        };

        let gate = self
            .inner
            .opening
            .lock()
            .await
            .entry(resource.clone())
            .or_default()
            .clone();
        let _opening = gate.lock().await;

        // whoever held the gate before us may have opened it already
        let Err(sender) = self.inner.try_join(&resource, subscriber_id, sender).await else {
            return Ok(Subscription { handle, events });
        };

        let opened = self.open_shared(&resource, subscriber_id, sender).await;
        self.inner.release_gate(&resource, &gate).await;
        opened?;

        Ok(Subscription { handle, events })
    }

    async fn open_shared(
        &self,
        resource: &ResourceId,
        subscriber_id: u64,
        sender: mpsc::UnboundedSender<RealtimeNotice>,
    ) -> SyncResult<()> {
        let channel = self
            .inner
            .open_channel(resource, None)
            .await
            .map_err(|err| SyncError::Subscription {
                resource: resource.to_string(),
                reason: err.to_string(),
            })?;

        let mut registry = self.inner.registry.lock().await;
        if let Some(shared) = registry.get_mut(resource) {
            // a later gate won the race; share its channel and drop ours
            shared.subscribers.insert(subscriber_id, sender);
            drop(registry);
            if let Err(err) = self.inner.transport.close(&channel.channel_id).await {
                debug!(%resource, error = %err, "Surplus channel did not close cleanly");
            }
            return Ok(());
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut shared = SharedChannel::new(
            channel.channel_id,
            generation,
            self.inner.dedup_capacity,
            self.inner.dedup_ttl,
        );
        shared.subscribers.insert(subscriber_id, sender);
        shared.pump = Some(tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            resource.clone(),
            generation,
            channel.messages,
        )));
        info!(%resource, channel_id = %shared.channel_id, "Opened realtime channel");
        registry.insert(resource.clone(), shared);
        Ok(())
    }

    /// Callback form of `subscribe`. `on_error` fires at most once, after
    /// resubscription has been exhausted.
    pub async fn subscribe_with<E, R>(
        &self,
        resource: ResourceId,
        on_event: E,
        on_error: R,
    ) -> SyncResult<SubscriptionHandle>
    where
        E: Fn(ChangeEvent) + Send + 'static,
        R: FnOnce(SyncError) + Send + 'static,
    {
        let Subscription { handle, mut events } = self.subscribe(resource).await?;
        tokio::spawn(async move {
            while let Some(notice) = events.recv().await {
                match notice {
                    RealtimeNotice::Event(event) => on_event(event),
                    RealtimeNotice::Error(err) => {
                        on_error(err);
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }

    /// Release one reference; the transport channel closes with the last one
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut registry = self.inner.registry.lock().await;
        let Some(shared) = registry.get_mut(&handle.resource) else {
            debug!(resource = %handle.resource, "Unsubscribe for a channel that is already gone");
            return;
        };
        if shared.subscribers.remove(&handle.subscriber_id).is_none() || !shared.subscribers.is_empty() {
            return;
        }

        let Some(shared) = registry.remove(&handle.resource) else {
            return;
        };
        drop(registry);
        self.inner.teardown(&handle.resource, shared).await;
    }

    /// Optimistic echo of a change made by this client. The id enters the
    /// dedup window so the server's push of the same row is dropped.
    pub async fn publish_local(&self, resource: &ResourceId, event: ChangeEvent) {
        let mut registry = self.inner.registry.lock().await;
        if let Some(shared) = registry.get_mut(resource) {
            if !shared.deliver(event, false) {
                self.inner.executor.metrics().record_duplicate();
            }
        }
    }

    pub async fn ref_count(&self, resource: &ResourceId) -> usize {
        let registry = self.inner.registry.lock().await;
        registry
            .get(resource)
            .map(|shared| shared.subscribers.len())
            .unwrap_or(0)
    }

    pub async fn channel_info(&self, resource: &ResourceId) -> Option<ChannelInfo> {
        let registry = self.inner.registry.lock().await;
        registry.get(resource).map(|shared| ChannelInfo {
            resource: resource.clone(),
            ref_count: shared.subscribers.len(),
            last_seen_id: shared.last_seen_id.clone(),
            channel_id: shared.channel_id.clone(),
        })
    }

    pub async fn active_channels(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Close every channel regardless of reference counts
    pub async fn shutdown(&self) {
        let drained: Vec<(ResourceId, SharedChannel)> = {
            let mut registry = self.inner.registry.lock().await;
            registry.drain().collect()
        };
        for (resource, shared) in drained {
            self.inner.teardown(&resource, shared).await;
        }
    }
}

impl Inner {
    /// Add a subscriber to an open channel, or hand the sender back
    async fn try_join(
        &self,
        resource: &ResourceId,
        subscriber_id: u64,
        sender: mpsc::UnboundedSender<RealtimeNotice>,
    ) -> Result<(), mpsc::UnboundedSender<RealtimeNotice>> {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(resource) {
            Some(shared) => {
                shared.subscribers.insert(subscriber_id, sender);
                debug!(%resource, ref_count = shared.subscribers.len(), "Joined existing channel");
                Ok(())
            }
            None => Err(sender),
        }
    }

    async fn release_gate(&self, resource: &ResourceId, gate: &Arc<Mutex<()>>) {
        let mut opening = self.opening.lock().await;
        if opening.get(resource).is_some_and(|current| Arc::ptr_eq(current, gate)) {
            opening.remove(resource);
        }
    }

    async fn open_channel(
        &self,
        resource: &ResourceId,
        resume_from: Option<String>,
    ) -> SyncResult<super::transport::TransportChannel> {
        self.executor
            .execute_named(
                "open_channel",
                || self.transport.open(resource, resume_from.clone()),
                &self.resubscribe_policy,
            )
            .await
    }

    async fn teardown(&self, resource: &ResourceId, shared: SharedChannel) {
        if let Some(pump) = shared.pump {
            pump.abort();
        }
        let result = self
            .executor
            .execute_named(
                "close_channel",
                || self.transport.close(&shared.channel_id),
                self.executor.default_policy(),
            )
            .await;
        match result {
            Ok(()) => info!(%resource, channel_id = %shared.channel_id, "Closed realtime channel"),
            Err(err) => warn!(%resource, error = %err, "Failed to close realtime channel"),
        }
    }

    async fn deliver(&self, resource: &ResourceId, generation: u64, events: Vec<ChangeEvent>) {
        let mut registry = self.registry.lock().await;
        let Some(shared) = registry
            .get_mut(resource)
            .filter(|shared| shared.generation == generation)
        else {
            return;
        };
        for event in events {
            let id = event.id.clone();
            if !shared.deliver(event, true) {
                self.executor.metrics().record_duplicate();
                debug!(%resource, event_id = %id, "Dropped duplicate event");
            }
        }
    }

    /// Reopen after a drop. `Ok(None)` means the channel was released meanwhile.
    async fn reconnect(
        &self,
        resource: &ResourceId,
        generation: u64,
    ) -> SyncResult<Option<BoxStream<'static, TransportMessage>>> {
        let (resume_from, old_channel) = {
            let registry = self.registry.lock().await;
            match registry.get(resource).filter(|s| s.generation == generation) {
                Some(shared) => (shared.last_seen_id.clone(), shared.channel_id.clone()),
                None => return Ok(None),
            }
        };

        if let Err(err) = self.transport.close(&old_channel).await {
            debug!(%resource, error = %err, "Dropped channel did not close cleanly");
        }

        let channel = self.open_channel(resource, resume_from.clone()).await?;
        let installed = {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(resource).filter(|s| s.generation == generation) {
                Some(shared) => {
                    shared.channel_id = channel.channel_id.clone();
                    true
                }
                None => false,
            }
        };
        if !installed {
            let _ = self.transport.close(&channel.channel_id).await;
            return Ok(None);
        }

        if channel.resumed {
            info!(%resource, resume_from = ?resume_from, "Resumed realtime channel");
        } else {
            self.resync(resource, generation).await?;
        }
        Ok(Some(channel.messages))
    }

    /// Fetch the current rows and push them through the dedup window
    async fn resync(&self, resource: &ResourceId, generation: u64) -> SyncResult<()> {
        let Some(data) = &self.snapshots else {
            warn!(%resource, "Transport could not resume and no snapshot source is configured");
            return Ok(());
        };

        let rows = self
            .executor
            .execute_named(
                "resync_snapshot",
                || data.select(resource.table, &resource.filter),
                self.executor.default_policy(),
            )
            .await?;
        self.executor.metrics().record_resync();
        info!(%resource, rows = rows.len(), "Full resync after reconnect");

        let events = rows
            .into_iter()
            .filter_map(ChangeEvent::from_snapshot_row)
            .collect();
        self.deliver(resource, generation, events).await;
        Ok(())
    }

    /// Resubscription is exhausted: tell every subscriber once and forget the channel
    async fn fail(&self, resource: &ResourceId, generation: u64, err: SyncError) {
        let shared = {
            let mut registry = self.registry.lock().await;
            let current = registry
                .get(resource)
                .map(|shared| shared.generation == generation)
                .unwrap_or(false);
            if !current {
                return;
            }
            registry.remove(resource)
        };
        let Some(shared) = shared else {
            return;
        };

        warn!(%resource, error = %err, "Realtime channel lost");
        for sender in shared.subscribers.values() {
            let _ = sender.send(RealtimeNotice::Error(SyncError::Subscription {
                resource: resource.to_string(),
                reason: err.to_string(),
            }));
        }
        let _ = self.transport.close(&shared.channel_id).await;
    }
}

/// A channel that stayed up this long is healthy again, events or not
const STABLE_CHANNEL: Duration = Duration::from_secs(30);

/// Reads one transport channel until the manager releases it.
///
/// Consecutive drops of short-lived, silent channels count as failed
/// resubscriptions: they back off on the resubscribe policy and give up
/// after `max_retries` of them.
async fn pump(
    inner: Weak<Inner>,
    resource: ResourceId,
    generation: u64,
    mut messages: BoxStream<'static, TransportMessage>,
) {
    let mut drops: u32 = 0;
    let mut live = false;
    let mut opened_at = Instant::now();

    loop {
        let message = messages.next().await;
        let Some(manager) = inner.upgrade() else {
            return;
        };

        let reason = match message {
            Some(TransportMessage::Event(event)) => {
                live = true;
                manager.deliver(&resource, generation, vec![event]).await;
                continue;
            }
            Some(TransportMessage::Error(reason)) => reason,
            Some(TransportMessage::Closed) | None => "transport closed".to_string(),
        };

        if live || opened_at.elapsed() >= STABLE_CHANNEL {
            drops = 0;
            live = false;
        }
        drops += 1;

        let policy = &manager.resubscribe_policy;
        if drops > policy.max_retries {
            let err = SyncError::ExhaustedRetries {
                attempts: drops,
                source: Box::new(SyncError::Remote(RemoteError::Network(reason))),
            };
            manager.fail(&resource, generation, err).await;
            return;
        }

        let delay = policy.delay_for(drops - 1);
        warn!(
            %resource,
            reason = %reason,
            attempt = drops,
            delay_ms = delay.as_millis() as u64,
            "Realtime channel dropped; resubscribing"
        );
        drop(manager);
        tokio::time::sleep(delay).await;

        let Some(manager) = inner.upgrade() else {
            return;
        };
        match manager.reconnect(&resource, generation).await {
            Ok(Some(next)) => {
                messages = next;
                opened_at = Instant::now();
            }
            Ok(None) => return,
            Err(err) => {
                manager.fail(&resource, generation, err).await;
                return;
            }
        }
    }
}
