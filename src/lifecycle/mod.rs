// Task lifecycle: status state machine plus the side-effect chain that
// follows every accepted transition.

pub mod coordinator;
pub mod model;
pub mod saga;
pub mod transitions;


pub use coordinator::{CreatedTask, TaskLifecycleCoordinator, TransitionOutcome};
pub use model::{
    Actor, ChatMessage, MessageKind, NewTask, Notification, Role, StatusTransitionRecord, Task,
    TaskStatus,
};
pub use saga::{Saga, SagaReport, StepOutcome, StepStatus};
pub use transitions::{allowed_transitions, can_transition};
