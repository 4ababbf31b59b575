// Durable offline queue for best-effort telemetry writes

pub mod durable;
pub mod event;
pub mod store;


pub use durable::DurableEventQueue;
pub use event::{FlushResult, QueuedEvent};
pub use store::{FileQueueStore, MemoryQueueStore, QueueStore};
