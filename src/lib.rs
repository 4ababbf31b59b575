// tasksync - client-side data consistency core for a task and chat app
// Exposes the four components plus the session wiring for integration

pub mod attachments;
pub mod config;
pub mod context;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub mod observability;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod telemetry;

// Re-export key types for easy access
pub use attachments::AttachmentService;
pub use config::{ObservabilityConfig, QueueConfig, RealtimeConfig, RetrySettings, SyncCoreConfig};
pub use context::{Backends, SessionContext};
pub use errors::{RemoteError, SyncError, SyncResult};
pub use executor::{RequestExecutor, RetryPolicy};
pub use lifecycle::{
    allowed_transitions, can_transition, Actor, NewTask, Role, TaskLifecycleCoordinator,
    TaskStatus, TransitionOutcome,
};
pub use observability::{OperationTimer, SyncMetrics, SyncStats};
pub use queue::{DurableEventQueue, FileQueueStore, FlushResult, MemoryQueueStore, QueuedEvent};
pub use realtime::{ChangeEvent, RealtimeChannelManager, RealtimeNotice, ResourceId};
pub use telemetry::{create_sync_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
