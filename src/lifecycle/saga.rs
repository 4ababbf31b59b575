// In-process runner for ordered best-effort side effects.
// Steps run in sequence; a failed step is recorded and the rest still run.
// Nothing is compensated.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaReport {
    pub saga: String,
    pub steps: Vec<StepOutcome>,
}

impl SagaReport {
    pub fn all_succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|outcome| !matches!(outcome.status, StepStatus::Failed { .. }))
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|outcome| matches!(outcome.status, StepStatus::Failed { .. }))
            .map(|outcome| outcome.step.as_str())
            .collect()
    }

    pub fn status_of(&self, step: &str) -> Option<&StepStatus> {
        self.steps
            .iter()
            .find(|outcome| outcome.step == step)
            .map(|outcome| &outcome.status)
    }
}

enum Step<'a> {
    Run(BoxFuture<'a, Result<(), SyncError>>),
    Skip(String),
}

pub struct Saga<'a> {
    name: String,
    steps: Vec<(String, Step<'a>)>,
}

impl<'a> Saga<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step. The future is not polled until the saga runs.
    pub fn step(mut self, name: impl Into<String>, action: BoxFuture<'a, Result<(), SyncError>>) -> Self {
        self.steps.push((name.into(), Step::Run(action)));
        self
    }

    /// Record a step that was decided not to run
    pub fn skip(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.steps.push((name.into(), Step::Skip(reason.into())));
        self
    }

    pub async fn run(self) -> SagaReport {
        let mut report = SagaReport {
            saga: self.name,
            steps: Vec::with_capacity(self.steps.len()),
        };

        for (step, action) in self.steps {
            let status = match action {
                Step::Run(future) => match future.await {
                    Ok(()) => {
                        debug!(saga = %report.saga, step = %step, "Side effect applied");
                        StepStatus::Succeeded
                    }
                    Err(err) => {
                        warn!(saga = %report.saga, step = %step, error = %err, "Side effect failed; continuing");
                        StepStatus::Failed {
                            error: err.to_string(),
                        }
                    }
                },
                Step::Skip(reason) => {
                    debug!(saga = %report.saga, step = %step, reason = %reason, "Side effect skipped");
                    StepStatus::Skipped { reason }
                }
            };
            report.steps.push(StepOutcome { step, status });
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RemoteError;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_failed_step_does_not_stop_later_steps() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let push = |label: &'static str, fail: bool| {
            let order = order.clone();
            async move {
                order.lock().unwrap().push(label);
                if fail {
                    Err(SyncError::Remote(RemoteError::Network("down".into())))
                } else {
                    Ok(())
                }
            }
            .boxed()
        };

        let report = Saga::new("status_change")
            .step("record", push("record", false))
            .step("message", push("message", true))
            .skip("notify", "no recipient")
            .step("audit", push("audit", false))
            .run()
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["record", "message", "audit"]);
        assert!(!report.all_succeeded());
        assert_eq!(report.failed_steps(), vec!["message"]);
        assert_eq!(report.status_of("record"), Some(&StepStatus::Succeeded));
        assert!(matches!(report.status_of("notify"), Some(StepStatus::Skipped { .. })));
    }
}
