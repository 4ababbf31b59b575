use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::attachments::AttachmentService;
use crate::config::SyncCoreConfig;
use crate::errors::{RemoteError, SyncResult};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::lifecycle::{
    Actor, CreatedTask, NewTask, TaskLifecycleCoordinator, TaskStatus, TransitionOutcome,
};
use crate::observability::SyncMetrics;
use crate::queue::{DurableEventQueue, FlushResult, QueueStore};
use crate::realtime::{RealtimeChannelManager, RealtimeTransport};
use crate::remote::{BlobStore, DataService, IdentityProvider, TelemetrySink, WorkflowEndpoint};
use crate::telemetry::{create_sync_span, generate_correlation_id};

/// Bucket holding task attachments
pub const ATTACHMENT_BUCKET: &str = "task-attachments";

/// Every external collaborator a session talks to
#[derive(Clone)]
pub struct Backends {
    pub data: Arc<dyn DataService>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub sink: Arc<dyn TelemetrySink>,
    pub identity: Arc<dyn IdentityProvider>,
    pub workflow: Option<Arc<dyn WorkflowEndpoint>>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue_store: Arc<dyn QueueStore>,
}

/// One client session's consistency core.
///
/// Built once from configuration and handed to whatever needs it; nothing
/// here is process-global.
pub struct SessionContext {
    session_id: String,
    config: SyncCoreConfig,
    metrics: Arc<SyncMetrics>,
    executor: RequestExecutor,
    identity: Arc<dyn IdentityProvider>,
    lifecycle: TaskLifecycleCoordinator,
    realtime: RealtimeChannelManager,
    queue: DurableEventQueue,
    attachments: AttachmentService,
}

impl SessionContext {
    pub async fn start(config: SyncCoreConfig, backends: Backends) -> SyncResult<Self> {
        let session_id = Uuid::new_v4().to_string();
        let metrics = Arc::new(SyncMetrics::new());
        let executor = RequestExecutor::new(RetryPolicy::from(&config.retry), metrics.clone());

        let realtime = RealtimeChannelManager::new(
            executor.clone(),
            backends.transport,
            Some(backends.data.clone()),
            &config.realtime,
        );

        let mut lifecycle = TaskLifecycleCoordinator::new(executor.clone(), backends.data)
            .with_realtime(realtime.clone());
        if let Some(workflow) = backends.workflow {
            lifecycle = lifecycle.with_workflow(workflow);
        }

        let queue = DurableEventQueue::open(
            backends.queue_store,
            backends.sink,
            executor.clone(),
            &config.queue,
            session_id.as_str(),
        )
        .await?;

        let attachments =
            AttachmentService::new(executor.clone(), backends.blobs, ATTACHMENT_BUCKET);

        info!(session_id = %session_id, "Sync session started");
        Ok(Self {
            session_id,
            config,
            metrics,
            executor,
            identity: backends.identity,
            lifecycle,
            realtime,
            queue,
            attachments,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SyncCoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn lifecycle(&self) -> &TaskLifecycleCoordinator {
        &self.lifecycle
    }

    pub fn realtime(&self) -> &RealtimeChannelManager {
        &self.realtime
    }

    pub fn queue(&self) -> &DurableEventQueue {
        &self.queue
    }

    pub fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    /// The signed-in actor; an anonymous session cannot mutate tasks
    pub async fn current_actor(&self) -> SyncResult<Actor> {
        let actor = self
            .executor
            .execute_default("current_actor", || self.identity.current_actor())
            .await?;
        actor.ok_or_else(|| RemoteError::Unauthorized("no signed-in user".to_string()).into())
    }

    pub async fn change_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        reason: Option<&str>,
    ) -> SyncResult<TransitionOutcome> {
        let correlation_id = generate_correlation_id();
        let span = create_sync_span("change_status", Some(task_id), Some(&correlation_id));
        async {
            let actor = self.current_actor().await?;
            self.lifecycle
                .change_status(task_id, new_status, &actor, reason)
                .await
        }
        .instrument(span)
        .await
    }

    pub async fn create_task(&self, new_task: NewTask) -> SyncResult<CreatedTask> {
        let correlation_id = generate_correlation_id();
        let span = create_sync_span("create_task", None, Some(&correlation_id));
        async {
            let actor = self.current_actor().await?;
            self.lifecycle.create_task(new_task, &actor).await
        }
        .instrument(span)
        .await
    }

    pub async fn track(
        &self,
        name: &str,
        properties: Value,
        subject_id: Option<&str>,
    ) -> SyncResult<()> {
        self.queue.track(name, properties, subject_id).await
    }

    pub async fn flush(&self) -> FlushResult {
        self.queue.flush().await
    }

    /// Last flush attempt, close every channel, report counters
    pub async fn shutdown(&self) -> FlushResult {
        let flushed = self.queue.flush().await;
        if !flushed.is_success() {
            warn!(result = ?flushed, "Telemetry left queued at shutdown");
        }
        self.realtime.shutdown().await;
        self.metrics.log_stats();
        info!(session_id = %self.session_id, "Sync session closed");
        flushed
    }
}
