use chrono::{SecondsFormat, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::model::{
    Actor, ChatMessage, NewTask, Notification, StatusTransitionRecord, Task, TaskStatus,
};
use super::saga::{Saga, SagaReport};
use super::transitions::can_transition;
use crate::errors::{SyncError, SyncResult};
use crate::executor::{RequestExecutor, RetryPolicy};
use crate::realtime::{ChangeEvent, RealtimeChannelManager, ResourceId};
use crate::remote::{DataService, Filter, Table, WorkflowEndpoint};

pub const STEP_RECORD: &str = "record_transition";
pub const STEP_MESSAGE: &str = "system_message";
pub const STEP_NOTIFY: &str = "notify_counterpart";
pub const STEP_WORKFLOW: &str = "task_created_workflow";

/// Result of an accepted status change
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub task: Task,
    pub record: StatusTransitionRecord,
    pub message: ChatMessage,
    pub notification: Option<Notification>,
    /// Per-step result of the secondary writes
    pub side_effects: SagaReport,
}

#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    pub side_effects: SagaReport,
}

/// Validates and applies task status transitions.
///
/// The status write is the only step that can fail the call. The audit
/// record, system chat message and notification follow as best-effort steps.
pub struct TaskLifecycleCoordinator {
    executor: RequestExecutor,
    data: Arc<dyn DataService>,
    workflow: Option<Arc<dyn WorkflowEndpoint>>,
    realtime: Option<RealtimeChannelManager>,
    policy: RetryPolicy,
}

impl TaskLifecycleCoordinator {
    pub fn new(executor: RequestExecutor, data: Arc<dyn DataService>) -> Self {
        let policy = executor.default_policy().clone();
        Self {
            executor,
            data,
            workflow: None,
            realtime: None,
            policy,
        }
    }

    pub fn with_workflow(mut self, workflow: Arc<dyn WorkflowEndpoint>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Echo system messages into open chat subscriptions before the server push arrives
    pub fn with_realtime(mut self, realtime: RealtimeChannelManager) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub async fn task(&self, task_id: &str) -> SyncResult<Task> {
        let filter = Filter::new().eq("id", task_id);
        let rows = self
            .executor
            .execute_named("fetch_task", || self.data.select(Table::Tasks, &filter), &self.policy)
            .await?;

        match rows.into_iter().next() {
            Some(row) => Ok(serde_json::from_value(row)?),
            None => Err(SyncError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            }),
        }
    }

    /// Audit trail for a task, oldest first
    pub async fn history(&self, task_id: &str) -> SyncResult<Vec<StatusTransitionRecord>> {
        let filter = Filter::new().eq("task_id", task_id);
        let rows = self
            .executor
            .execute_named(
                "fetch_history",
                || self.data.select(Table::TaskStatusHistory, &filter),
                &self.policy,
            )
            .await?;

        let mut records = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<StatusTransitionRecord>, _>>()?;
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    #[instrument(skip(self, actor, reason), fields(actor = %actor.id, role = %actor.role))]
    pub async fn change_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        actor: &Actor,
        reason: Option<&str>,
    ) -> SyncResult<TransitionOutcome> {
        let current = self.task(task_id).await?;
        let old_status = current.status;

        if !can_transition(old_status, new_status, actor.role) {
            return Err(SyncError::InvalidTransition {
                from: old_status,
                to: new_status,
                role: actor.role,
            });
        }

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if new_status.requires_reason() && reason.is_none() {
            return Err(SyncError::MissingReason { status: new_status });
        }

        let task = self.write_status(&current, new_status).await?;
        info!(
            task_id,
            from = %old_status,
            to = %new_status,
            "Task status changed"
        );

        let now = Utc::now();
        let record = StatusTransitionRecord {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            old_status,
            new_status,
            actor_id: actor.id.clone(),
            reason: reason.map(str::to_string),
            created_at: now,
        };

        let mut text = format!(
            "Status changed from {} to {}",
            old_status.label(),
            new_status.label()
        );
        if let Some(reason) = reason {
            text.push_str(&format!(": {reason}"));
        }
        let message = ChatMessage {
            created_at: now,
            ..ChatMessage::system(task_id, &actor.id, text)
        };

        let notification = task.counterpart_of(&actor.id).map(|recipient| Notification {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient.to_string(),
            task_id: task_id.to_string(),
            title: "Task status updated".to_string(),
            body: match reason {
                Some(reason) => format!("{} is now {}: {reason}", task.title, new_status.label()),
                None => format!("{} is now {}", task.title, new_status.label()),
            },
            read: false,
            created_at: now,
        });

        let mut saga = Saga::new("status_change")
            .step(STEP_RECORD, self.insert_row(Table::TaskStatusHistory, &record).boxed())
            .step(STEP_MESSAGE, self.post_system_message(&message).boxed());
        saga = match &notification {
            Some(notification) => saga.step(
                STEP_NOTIFY,
                self.insert_row(Table::Notifications, notification).boxed(),
            ),
            None => saga.skip(STEP_NOTIFY, "no counterpart besides the actor"),
        };
        let side_effects = saga.run().await;

        Ok(TransitionOutcome {
            task,
            record,
            message,
            notification,
            side_effects,
        })
    }

    /// Insert a new task in `pending`, then kick the creation workflow best-effort
    #[instrument(skip(self, new_task, actor), fields(actor = %actor.id))]
    pub async fn create_task(&self, new_task: NewTask, actor: &Actor) -> SyncResult<CreatedTask> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            title: new_task.title,
            status: TaskStatus::Pending,
            priority: new_task.priority,
            assignee_id: new_task.assignee_id,
            created_by: actor.id.clone(),
            client_id: new_task.client_id,
            created_at: now,
            updated_at: now,
        };

        let row = serde_json::to_value(&task)?;
        let stored = self
            .executor
            .execute_named(
                "insert_task",
                || self.data.insert(Table::Tasks, row.clone()),
                &self.policy,
            )
            .await?;
        let task: Task = serde_json::from_value(stored)?;
        info!(task_id = %task.id, "Task created");

        let saga = Saga::new("task_created");
        let saga = match &self.workflow {
            Some(workflow) => {
                let payload = json!({ "event": "task_created", "task": &task });
                let step = async move {
                    self.executor
                        .execute_named(
                            "task_created_workflow",
                            || workflow.invoke("task_created", payload.clone()),
                            &self.policy,
                        )
                        .await
                        .map(|_| ())
                };
                saga.step(STEP_WORKFLOW, step.boxed())
            }
            None => saga.skip(STEP_WORKFLOW, "no workflow endpoint configured"),
        };
        let side_effects = saga.run().await;

        Ok(CreatedTask { task, side_effects })
    }

    /// Compare-and-set on the status column. A retried write that already
    /// landed is recognised by its `updated_at` stamp.
    async fn write_status(&self, current: &Task, new_status: TaskStatus) -> SyncResult<Task> {
        let stamp = Utc::now();
        let filter = Filter::new()
            .eq("id", current.id.as_str())
            .eq("status", current.status.as_str());
        let patch = json!({ "status": new_status, "updated_at": stamp });

        let rows = self
            .executor
            .execute_named(
                "update_task_status",
                || self.data.update(Table::Tasks, &filter, patch.clone()),
                &self.policy,
            )
            .await?;

        if let Some(row) = rows.into_iter().next() {
            return Ok(serde_json::from_value(row)?);
        }

        let latest = self.task(&current.id).await?;
        if latest.status == new_status && same_instant(&latest, &stamp) {
            warn!(task_id = %current.id, "Status write applied by an earlier timed-out attempt");
            return Ok(latest);
        }

        Err(SyncError::ConcurrentModification {
            task_id: current.id.clone(),
            expected: current.status,
        })
    }

    async fn insert_row<T: serde::Serialize>(&self, table: Table, row: &T) -> SyncResult<()> {
        let row: Value = serde_json::to_value(row)?;
        self.executor
            .execute_named(table.as_str(), || self.data.insert(table, row.clone()), &self.policy)
            .await?;
        Ok(())
    }

    async fn post_system_message(&self, message: &ChatMessage) -> SyncResult<()> {
        self.insert_row(Table::ChatMessages, message).await?;

        if let Some(realtime) = &self.realtime {
            let resource = ResourceId::task_chat(&message.task_id);
            let event = ChangeEvent::insert(&message.id, serde_json::to_value(message)?);
            realtime.publish_local(&resource, event).await;
        }
        Ok(())
    }
}

fn same_instant(task: &Task, stamp: &chrono::DateTime<Utc>) -> bool {
    task.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true)
        == stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}
