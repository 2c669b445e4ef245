//! Queue administration and enqueueing.

use std::sync::Arc;

use tracing::info;

use vconv_models::{ApiToken, Queue, QueueId, Task, TaskId, TaskStatus};
use vconv_store::{DeleteOutcome, OverrideOutcome, Store};

use crate::clock::Clock;
use crate::error::{CoordResult, CoordinatorError};
use crate::metrics;

#[derive(Clone)]
pub struct QueueService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl QueueService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn list_queues(&self) -> CoordResult<Vec<Queue>> {
        Ok(self.store.list_queues().await?)
    }

    pub async fn create_queue(&self, name: &str) -> CoordResult<Queue> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::validation("name is required"));
        }
        let queue = self.store.create_queue(name, self.clock.now()).await?;
        info!(queue_id = %queue.id, name = %queue.name, "Queue created");
        Ok(queue)
    }

    pub async fn get_queue(&self, id: &QueueId) -> CoordResult<Queue> {
        self.store
            .get_queue(id)
            .await?
            .ok_or_else(|| CoordinatorError::not_found("Queue", id))
    }

    /// Delete an empty queue.
    pub async fn delete_queue(&self, id: &QueueId) -> CoordResult<()> {
        match self.store.delete_queue(id).await? {
            DeleteOutcome::Deleted => {
                info!(queue_id = %id, "Queue deleted");
                Ok(())
            }
            DeleteOutcome::NotFound => Err(CoordinatorError::not_found("Queue", id)),
            DeleteOutcome::NotEmpty => Err(CoordinatorError::conflict(format!(
                "Queue {} still holds tasks",
                id
            ))),
        }
    }

    /// Create a WAITING task in `queue` on behalf of `token`, whose ceiling
    /// bounds the priority.
    pub async fn enqueue(
        &self,
        queue: &QueueId,
        name: &str,
        priority: i32,
        token: &ApiToken,
    ) -> CoordResult<Task> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::validation("name is required"));
        }
        if !token.permits(priority) {
            return Err(CoordinatorError::PriorityCeiling {
                priority,
                ceiling: token.max_priority,
            });
        }

        let task = Task::new(queue.clone(), name, priority, self.clock.now());
        if !self.store.insert_task(&task).await? {
            return Err(CoordinatorError::not_found("Queue", queue));
        }
        metrics::record_task_enqueued(queue.as_str());
        info!(task_id = %task.id, queue_id = %queue, priority, "Task enqueued");
        Ok(task)
    }

    pub async fn list_tasks(&self, queue: &QueueId) -> CoordResult<Vec<Task>> {
        self.get_queue(queue).await?;
        Ok(self.store.list_tasks(queue).await?)
    }

    pub async fn delete_task(&self, queue: &QueueId, task: &TaskId) -> CoordResult<()> {
        if !self.store.delete_task(queue, task).await? {
            return Err(CoordinatorError::not_found("Task", task));
        }
        info!(task_id = %task, queue_id = %queue, "Task deleted");
        Ok(())
    }

    /// Set a task's status directly, bypassing the state machine. Active
    /// statuses are only accepted for a task some machine holds.
    pub async fn override_status(
        &self,
        queue: &QueueId,
        task: &TaskId,
        status: TaskStatus,
    ) -> CoordResult<Task> {
        let updated = match self
            .store
            .override_status(queue, task, status, self.clock.now())
            .await?
        {
            OverrideOutcome::Applied(updated) => updated,
            OverrideOutcome::NotFound => return Err(CoordinatorError::not_found("Task", task)),
            OverrideOutcome::Unowned => {
                return Err(CoordinatorError::conflict(format!(
                    "Task {} is not held by a machine; cannot set {}",
                    task, status
                )))
            }
        };
        info!(task_id = %task, queue_id = %queue, %status, "Task status overridden");
        Ok(updated)
    }
}
