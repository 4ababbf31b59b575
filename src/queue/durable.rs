use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::event::{FlushResult, QueuedEvent};
use super::store::QueueStore;
use crate::config::QueueConfig;
use crate::errors::{SyncError, SyncResult};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::observability::OperationTimer;
use crate::remote::TelemetrySink;

/// What the sink said about one batch
struct Shipment {
    /// Subjects the sink no longer knows
    missing: HashSet<String>,
    /// How many events the sink accepted, or why nothing was sent
    sent: SyncResult<usize>,
}

fn is_doomed(event: &QueuedEvent, missing: &HashSet<String>) -> bool {
    event
        .subject_id
        .as_deref()
        .is_some_and(|subject| missing.contains(subject))
}

struct QueueInner {
    store: Arc<dyn QueueStore>,
    sink: Arc<dyn TelemetrySink>,
    executor: RequestExecutor,
    policy: RetryPolicy,
    budget: Duration,
    max_events: usize,
    session_id: String,
    /// In-memory mirror of the stored list; every mutation is persisted under this lock
    events: Mutex<Vec<QueuedEvent>>,
    /// Held for the whole of a flush
    flushing: Mutex<()>,
}

/// Local buffer for best-effort telemetry.
///
/// `append` only touches local storage. `flush` ships the current batch and
/// removes it from the list once the sink has accepted it.
#[derive(Clone)]
pub struct DurableEventQueue {
    inner: Arc<QueueInner>,
}

impl DurableEventQueue {
    /// Load whatever a previous session left behind and start buffering
    pub async fn open(
        store: Arc<dyn QueueStore>,
        sink: Arc<dyn TelemetrySink>,
        executor: RequestExecutor,
        config: &QueueConfig,
        session_id: impl Into<String>,
    ) -> SyncResult<Self> {
        let events = store.load().await?;
        if !events.is_empty() {
            info!(pending = events.len(), "Recovered queued telemetry events");
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                sink,
                executor,
                policy: RetryPolicy::from(&config.flush),
                budget: config.flush_budget(),
                max_events: config.max_events.max(1),
                session_id: session_id.into(),
                events: Mutex::new(events),
                flushing: Mutex::new(()),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Build an event stamped with this session and append it
    pub async fn track(
        &self,
        name: &str,
        properties: Value,
        subject_id: Option<&str>,
    ) -> SyncResult<()> {
        let mut event = QueuedEvent::new(name, properties, self.inner.session_id.as_str());
        event.subject_id = subject_id.map(str::to_string);
        self.append(event).await
    }

    /// Persist `event` locally. Oldest events are evicted beyond capacity.
    pub async fn append(&self, event: QueuedEvent) -> SyncResult<()> {
        let mut events = self.inner.events.lock().await;
        debug!(event = %event.name, id = %event.id, "Queueing telemetry event");
        events.push(event);
        self.inner.executor.metrics().record_queued();

        if events.len() > self.inner.max_events {
            let excess = events.len() - self.inner.max_events;
            events.drain(0..excess);
            self.inner.executor.metrics().record_evicted(excess);
            warn!(
                evicted = excess,
                capacity = self.inner.max_events,
                "Telemetry queue full; evicted oldest events"
            );
        }

        self.inner.store.save(&events).await
    }

    /// Try to ship everything queued so far.
    ///
    /// Returns `AlreadyRunning` without touching the queue when another
    /// flush is in progress.
    #[instrument(skip(self), fields(session = %self.inner.session_id))]
    pub async fn flush(&self) -> FlushResult {
        let Ok(_flushing) = self.inner.flushing.try_lock() else {
            debug!("Flush already in progress");
            return FlushResult::AlreadyRunning;
        };

        let batch = self.inner.events.lock().await.clone();
        if batch.is_empty() {
            return FlushResult::Empty;
        }

        let size = batch.len();
        let timer = OperationTimer::new("telemetry_flush");
        // the budget bounds the sink; bookkeeping after an answer always runs
        let result = match tokio::time::timeout(self.inner.budget, self.ship(&batch)).await {
            Ok(shipment) => self.settle(&batch, shipment).await,
            Err(_) => {
                warn!(
                    budget_ms = self.inner.budget.as_millis() as u64,
                    "Flush exceeded its time budget; batch retained"
                );
                FlushResult::Failed {
                    retained: size,
                    dropped: 0,
                    error: SyncError::Timeout {
                        timeout_ms: self.inner.budget.as_millis() as u64,
                    }
                    .to_string(),
                }
            }
        };
        timer.finish();
        result
    }

    /// Verify subjects and send whatever survives. Touches nothing local.
    async fn ship(&self, batch: &[QueuedEvent]) -> Shipment {
        let subjects: BTreeSet<&str> = batch
            .iter()
            .filter_map(|event| event.subject_id.as_deref())
            .collect();

        let mut missing: HashSet<String> = HashSet::new();
        for subject in subjects {
            let exists = self
                .inner
                .executor
                .execute_named(
                    "verify_subject",
                    || self.inner.sink.subject_exists(subject),
                    &self.inner.policy,
                )
                .await;
            match exists {
                Ok(true) => {}
                Ok(false) => {
                    let err = SyncError::ReferentialIntegrity {
                        subject_id: subject.to_string(),
                    };
                    warn!(error = %err, "Dropping events for a deleted subject");
                    missing.insert(subject.to_string());
                }
                Err(err) => {
                    error!(error = %err, "Could not verify event subjects; batch retained");
                    return Shipment {
                        missing,
                        sent: Err(err),
                    };
                }
            }
        }

        let to_send: Vec<QueuedEvent> = batch
            .iter()
            .filter(|event| !is_doomed(event, &missing))
            .cloned()
            .collect();
        if to_send.is_empty() {
            return Shipment {
                missing,
                sent: Ok(0),
            };
        }

        let sent = self
            .inner
            .executor
            .execute_named(
                "send_batch",
                || self.inner.sink.send_batch(&to_send),
                &self.inner.policy,
            )
            .await
            .map(|()| to_send.len());
        Shipment { missing, sent }
    }

    /// Apply the sink's answer to the local list
    async fn settle(&self, batch: &[QueuedEvent], shipment: Shipment) -> FlushResult {
        let Shipment { missing, sent } = shipment;
        let (doomed, to_send): (Vec<&QueuedEvent>, Vec<&QueuedEvent>) =
            batch.iter().partition(|event| is_doomed(event, &missing));
        let dropped = doomed.len();

        let mut acked: HashSet<&str> = doomed.iter().map(|event| event.id.as_str()).collect();
        if sent.is_ok() {
            acked.extend(to_send.iter().map(|event| event.id.as_str()));
        }
        if !acked.is_empty() {
            self.remove(acked).await;
        }
        if dropped > 0 {
            self.inner.executor.metrics().record_dropped(dropped);
        }

        match sent {
            Ok(sent) => {
                if sent > 0 {
                    self.inner.executor.metrics().record_sent(sent);
                    info!(sent, dropped, "Telemetry batch flushed");
                }
                FlushResult::Sent { sent, dropped }
            }
            Err(err) => {
                warn!(retained = to_send.len(), error = %err, "Telemetry flush failed; batch retained");
                FlushResult::Failed {
                    retained: to_send.len(),
                    dropped,
                    error: err.to_string(),
                }
            }
        }
    }

    /// Remove acknowledged or dropped events; anything appended meanwhile stays
    async fn remove(&self, ids: HashSet<&str>) {
        let mut events = self.inner.events.lock().await;
        events.retain(|event| !ids.contains(event.id.as_str()));
        if let Err(err) = self.inner.store.save(&events).await {
            error!(error = %err, "Failed to persist queue after flush");
        }
    }

    pub async fn pending(&self) -> Vec<QueuedEvent> {
        self.inner.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.events.lock().await.is_empty()
    }

    /// Drop everything queued, locally and in the store
    pub async fn clear(&self) -> SyncResult<usize> {
        let mut events = self.inner.events.lock().await;
        let cleared = events.len();
        events.clear();
        self.inner.store.save(&events).await?;
        Ok(cleared)
    }
}
