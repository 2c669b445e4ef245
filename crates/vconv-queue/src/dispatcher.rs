//! Priority-ordered, exclusive task assignment.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vconv_models::{MachineId, QueueId, Task, TaskId};
use vconv_store::{ClaimOutcome, Store};

use crate::clock::Clock;
use crate::error::{CoordResult, CoordinatorError};
use crate::metrics;

/// Hands WAITING tasks to machines.
///
/// Selection is a read and the claim is a conditional write in the store, so
/// a task handed to one machine can never be handed to another. When the
/// candidate is taken between the two steps the dispatcher selects again.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Lost claim races retried before giving up.
    pub const MAX_CLAIM_ATTEMPTS: usize = 8;

    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Claim the best WAITING task for `machine`, optionally from one queue.
    ///
    /// Returns `Ok(None)` when nothing is waiting or every candidate was
    /// taken by other machines.
    pub async fn next_task(
        &self,
        machine: &MachineId,
        queue: Option<&QueueId>,
    ) -> CoordResult<Option<Task>> {
        if let Some(queue) = queue {
            if self.store.get_queue(queue).await?.is_none() {
                return Err(CoordinatorError::not_found("Queue", queue));
            }
        }

        for attempt in 1..=Self::MAX_CLAIM_ATTEMPTS {
            let Some(candidate) = self.store.peek_waiting(queue).await? else {
                return Ok(None);
            };

            match self
                .store
                .claim_task(&candidate.id, machine, self.clock.now())
                .await?
            {
                ClaimOutcome::Claimed(task) => {
                    metrics::record_task_claimed();
                    info!(task_id = %task.id, machine_id = %machine, priority = task.priority, "Task claimed");
                    return Ok(Some(task));
                }
                ClaimOutcome::NotWaiting(_) | ClaimOutcome::NotFound => {
                    metrics::record_claim_conflict();
                    debug!(task_id = %candidate.id, machine_id = %machine, attempt, "Lost claim race, selecting again");
                }
            }
        }

        warn!(
            machine_id = %machine,
            attempts = Self::MAX_CLAIM_ATTEMPTS,
            "Every candidate was taken by other machines"
        );
        Ok(None)
    }

    /// Claim a specific task. `Ok(None)` if it is no longer WAITING.
    pub async fn claim(&self, task_id: &TaskId, machine: &MachineId) -> CoordResult<Option<Task>> {
        match self.store.claim_task(task_id, machine, self.clock.now()).await? {
            ClaimOutcome::Claimed(task) => {
                metrics::record_task_claimed();
                info!(task_id = %task.id, machine_id = %machine, "Task claimed by id");
                Ok(Some(task))
            }
            ClaimOutcome::NotWaiting(status) => {
                metrics::record_claim_conflict();
                debug!(task_id = %task_id, machine_id = %machine, %status, "Task not available");
                Ok(None)
            }
            ClaimOutcome::NotFound => Err(CoordinatorError::not_found("Task", task_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chrono::Utc;
    use vconv_models::TaskStatus;
    use vconv_store::InMemoryStore;

    fn dispatcher() -> (Arc<InMemoryStore>, Dispatcher) {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(SystemClock));
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_empty_pool_is_not_an_error() {
        let (_, dispatcher) = dispatcher();
        let task = dispatcher.next_task(&MachineId::from("m"), None).await.unwrap();
        assert!(task.is_none());
    }

    #[tokio::test]
    async fn test_unknown_queue_filter() {
        let (_, dispatcher) = dispatcher();
        let err = dispatcher
            .next_task(&MachineId::from("m"), Some(&QueueId::from("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound { entity: "Queue", .. }));
    }

    #[tokio::test]
    async fn test_claim_by_id() {
        let (store, dispatcher) = dispatcher();
        let queue = store.create_queue("default", Utc::now()).await.unwrap();
        let task = Task::new(queue.id, "clip.mp4", 0, Utc::now());
        store.insert_task(&task).await.unwrap();

        let claimed = dispatcher.claim(&task.id, &MachineId::from("a")).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Downloading);
        assert!(dispatcher.claim(&task.id, &MachineId::from("b")).await.unwrap().is_none());

        let err = dispatcher.claim(&TaskId::from("nope"), &MachineId::from("a")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound { entity: "Task", .. }));
    }
}
