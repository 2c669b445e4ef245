//! In-memory store implementation.
//!
//! [`InMemoryStore`] keeps every table behind one `RwLock`, so each trait
//! method is trivially atomic. It backs the test suites and single-process
//! development runs (`STORE_BACKEND=memory`).
//!
//! ## Limitations
//!
//! - No durability: all state is lost when the process exits
//! - Single-process only: two coordinators cannot share it

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vconv_models::{
    ApiToken, Machine, MachineId, Queue, QueueId, Stage, Task, TaskId, TaskStatus, TerminalOutcome,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{ClaimOutcome, DeleteOutcome, OverrideOutcome, Store, TransitionOutcome};

#[derive(Debug, Default)]
struct Tables {
    queues: HashMap<QueueId, Queue>,
    tasks: HashMap<TaskId, Task>,
    machines: HashMap<MachineId, Machine>,
    tokens: HashMap<String, ApiToken>,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

/// Converts a lock poison error to a store error.
fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::backend("lock poisoned")
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared ownership/terminal checks for owner-driven transitions.
fn check_owned<'a>(
    tasks: &'a mut HashMap<TaskId, Task>,
    id: &TaskId,
    machine: &MachineId,
) -> Result<&'a mut Task, TransitionOutcome> {
    let task = tasks.get_mut(id).ok_or(TransitionOutcome::NotFound)?;
    if !task.is_owned_by(machine) {
        return Err(TransitionOutcome::NotOwner);
    }
    if task.is_terminal() {
        return Err(TransitionOutcome::AlreadyTerminal(task.status));
    }
    Ok(task)
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_queue(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Queue> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.queues.values().any(|q| q.name == name) {
            return Err(StoreError::duplicate(format!("queue name '{}'", name)));
        }
        let queue = Queue::new(name, now);
        tables.queues.insert(queue.id.clone(), queue.clone());
        Ok(queue)
    }

    async fn list_queues(&self) -> StoreResult<Vec<Queue>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut queues: Vec<Queue> = tables.queues.values().cloned().collect();
        queues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(queues)
    }

    async fn get_queue(&self, id: &QueueId) -> StoreResult<Option<Queue>> {
        Ok(self.tables.read().map_err(poison_err)?.queues.get(id).cloned())
    }

    async fn delete_queue(&self, id: &QueueId) -> StoreResult<DeleteOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if !tables.queues.contains_key(id) {
            return Ok(DeleteOutcome::NotFound);
        }
        if tables.tasks.values().any(|t| &t.queue_id == id) {
            return Ok(DeleteOutcome::NotEmpty);
        }
        tables.queues.remove(id);
        Ok(DeleteOutcome::Deleted)
    }

    async fn insert_task(&self, task: &Task) -> StoreResult<bool> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if !tables.queues.contains_key(&task.queue_id) {
            return Ok(false);
        }
        if tables.tasks.contains_key(&task.id) {
            return Err(StoreError::duplicate(format!("task id '{}'", task.id)));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(true)
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        Ok(self.tables.read().map_err(poison_err)?.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, queue: &QueueId) -> StoreResult<Vec<Task>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| &t.queue_id == queue)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete_task(&self, queue: &QueueId, id: &TaskId) -> StoreResult<bool> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        match tables.tasks.get(id) {
            Some(task) if &task.queue_id == queue => {
                tables.tasks.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn peek_waiting(&self, queue: Option<&QueueId>) -> StoreResult<Option<Task>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let best = tables
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting)
            .filter(|t| queue.map_or(true, |q| &t.queue_id == q))
            .min_by(|a, b| a.dispatch_order(b))
            .cloned();
        Ok(best)
    }

    async fn claim_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(task) = tables.tasks.get_mut(id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if task.status != TaskStatus::Waiting {
            return Ok(ClaimOutcome::NotWaiting(task.status));
        }
        task.claim(machine, now);
        Ok(ClaimOutcome::Claimed(task.clone()))
    }

    async fn record_progress(
        &self,
        id: &TaskId,
        machine: &MachineId,
        stage: Stage,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let task = match check_owned(&mut tables.tasks, id, machine) {
            Ok(task) => task,
            Err(outcome) => return Ok(outcome),
        };
        task.apply_progress(stage, payload, now);
        Ok(TransitionOutcome::Applied(task.clone()))
    }

    async fn finish_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        outcome: TerminalOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome> {
        let mut guard = self.tables.write().map_err(poison_err)?;
        let tables = &mut *guard;

        // A machine that no longer exists cannot be credited, so it owns nothing.
        let Some(owner) = tables.machines.get_mut(machine) else {
            return Ok(match tables.tasks.contains_key(id) {
                true => TransitionOutcome::NotOwner,
                false => TransitionOutcome::NotFound,
            });
        };
        let task = match check_owned(&mut tables.tasks, id, machine) {
            Ok(task) => task,
            Err(outcome) => return Ok(outcome),
        };

        task.apply_terminal(&outcome, now);
        match outcome {
            TerminalOutcome::Finished(_) => owner.success_count += 1,
            TerminalOutcome::Failed(_) => owner.failed_count += 1,
        }
        Ok(TransitionOutcome::Applied(task.clone()))
    }

    async fn override_status(
        &self,
        queue: &QueueId,
        id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<OverrideOutcome> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let Some(task) = tables.tasks.get_mut(id).filter(|t| &t.queue_id == queue) else {
            return Ok(OverrideOutcome::NotFound);
        };
        if status.is_active() && task.machine_id.is_none() {
            return Ok(OverrideOutcome::Unowned);
        }
        task.status = status;
        if status == TaskStatus::Waiting {
            task.machine_id = None;
        }
        task.updated_at = now;
        Ok(OverrideOutcome::Applied(task.clone()))
    }

    async fn task_status_counts(
        &self,
        machine: Option<&MachineId>,
    ) -> StoreResult<Vec<(TaskStatus, u64)>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
        for task in tables.tasks.values() {
            if machine.map_or(true, |m| task.is_owned_by(m)) {
                *counts.entry(task.status).or_insert(0) += 1;
            }
        }
        Ok(counts.into_iter().collect())
    }

    async fn create_machine(&self, machine: &Machine) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        for existing in tables.machines.values() {
            if existing.name == machine.name {
                return Err(StoreError::duplicate(format!("machine name '{}'", machine.name)));
            }
            if existing.ip == machine.ip {
                return Err(StoreError::duplicate(format!("machine ip '{}'", machine.ip)));
            }
            if existing.token == machine.token {
                return Err(StoreError::duplicate("machine token"));
            }
        }
        tables.machines.insert(machine.id.clone(), machine.clone());
        Ok(())
    }

    async fn list_machines(&self) -> StoreResult<Vec<Machine>> {
        let tables = self.tables.read().map_err(poison_err)?;
        let mut machines: Vec<Machine> = tables.machines.values().cloned().collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(machines)
    }

    async fn get_machine(&self, id: &MachineId) -> StoreResult<Option<Machine>> {
        Ok(self.tables.read().map_err(poison_err)?.machines.get(id).cloned())
    }

    async fn find_machine_by_token(&self, token: &str) -> StoreResult<Option<Machine>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.machines.values().find(|m| m.token == token).cloned())
    }

    async fn delete_machine(&self, id: &MachineId) -> StoreResult<bool> {
        Ok(self.tables.write().map_err(poison_err)?.machines.remove(id).is_some())
    }

    async fn record_heartbeat(
        &self,
        id: &MachineId,
        device_info: serde_json::Value,
        encoder: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Machine>> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        Ok(tables.machines.get_mut(id).map(|machine| {
            machine.record_heartbeat(device_info, encoder, now);
            machine.clone()
        }))
    }

    async fn mark_online(&self, id: &MachineId, now: DateTime<Utc>) -> StoreResult<Option<Machine>> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        Ok(tables.machines.get_mut(id).map(|machine| {
            machine.mark_online(now);
            machine.clone()
        }))
    }

    async fn create_token(&self, token: &ApiToken) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        if tables.tokens.contains_key(&token.token) {
            return Err(StoreError::duplicate("api token"));
        }
        tables.tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<ApiToken>> {
        Ok(self.tables.read().map_err(poison_err)?.tokens.get(token).cloned())
    }

    async fn count_tokens(&self) -> StoreResult<u64> {
        Ok(self.tables.read().map_err(poison_err)?.tokens.len() as u64)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.tables.read().map_err(poison_err).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn seeded() -> (InMemoryStore, Queue, Machine) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let queue = store.create_queue("default", now).await.unwrap();
        let machine = Machine::new("encoder-01", "10.0.0.1", now);
        store.create_machine(&machine).await.unwrap();
        (store, queue, machine)
    }

    #[tokio::test]
    async fn test_claim_is_conditional_on_waiting() {
        let (store, queue, machine) = seeded().await;
        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        store.insert_task(&task).await.unwrap();

        let first = store.claim_task(&task.id, &machine.id, Utc::now()).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(ref t) if t.is_owned_by(&machine.id)));

        let second = store.claim_task(&task.id, &MachineId::from("other"), Utc::now()).await.unwrap();
        assert_eq!(second, ClaimOutcome::NotWaiting(TaskStatus::Downloading));

        let missing = store.claim_task(&TaskId::from("nope"), &machine.id, Utc::now()).await.unwrap();
        assert_eq!(missing, ClaimOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_peek_orders_by_priority_then_age() {
        let (store, queue, _) = seeded().await;
        let t0 = Utc::now();
        let low = Task::new(queue.id.clone(), "low", 1, t0);
        let old = Task::new(queue.id.clone(), "old", 5, t0 + Duration::seconds(1));
        let new = Task::new(queue.id.clone(), "new", 5, t0 + Duration::seconds(2));
        for task in [&low, &new, &old] {
            store.insert_task(task).await.unwrap();
        }

        let best = store.peek_waiting(None).await.unwrap().unwrap();
        assert_eq!(best.id, old.id);

        let other = store.create_queue("other", t0).await.unwrap();
        assert!(store.peek_waiting(Some(&other.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_updates_task_and_counter_together() {
        let (store, queue, machine) = seeded().await;
        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        store.insert_task(&task).await.unwrap();
        store.claim_task(&task.id, &machine.id, Utc::now()).await.unwrap();

        let done = store
            .finish_task(&task.id, &machine.id, TerminalOutcome::Finished(json!({"url": "s3://out"})), Utc::now())
            .await
            .unwrap();
        assert!(matches!(done, TransitionOutcome::Applied(ref t) if t.status == TaskStatus::Finished));

        let again = store
            .finish_task(&task.id, &machine.id, TerminalOutcome::Failed("late".into()), Utc::now())
            .await
            .unwrap();
        assert_eq!(again, TransitionOutcome::AlreadyTerminal(TaskStatus::Finished));

        let machine = store.get_machine(&machine.id).await.unwrap().unwrap();
        assert_eq!(machine.success_count, 1);
        assert_eq!(machine.failed_count, 0);
    }

    #[tokio::test]
    async fn test_progress_rejects_non_owner() {
        let (store, queue, machine) = seeded().await;
        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        store.insert_task(&task).await.unwrap();
        store.claim_task(&task.id, &machine.id, Utc::now()).await.unwrap();

        let outcome = store
            .record_progress(&task.id, &MachineId::from("intruder"), Stage::Download, json!(50), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::NotOwner);
        assert!(store.get_task(&task.id).await.unwrap().unwrap().download_info.is_none());
    }

    #[tokio::test]
    async fn test_unique_machine_fields() {
        let (store, _, machine) = seeded().await;
        let same_ip = Machine::new("encoder-02", machine.ip.clone(), Utc::now());
        assert!(store.create_machine(&same_ip).await.unwrap_err().is_duplicate());
    }

    #[tokio::test]
    async fn test_queue_delete_refused_while_not_empty() {
        let (store, queue, _) = seeded().await;
        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        store.insert_task(&task).await.unwrap();

        assert_eq!(store.delete_queue(&queue.id).await.unwrap(), DeleteOutcome::NotEmpty);
        assert!(store.delete_task(&queue.id, &task.id).await.unwrap());
        assert_eq!(store.delete_queue(&queue.id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete_queue(&queue.id).await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_insert_refused_into_deleted_queue() {
        let (store, queue, _) = seeded().await;
        assert_eq!(store.delete_queue(&queue.id).await.unwrap(), DeleteOutcome::Deleted);

        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        assert!(!store.insert_task(&task).await.unwrap());
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.peek_waiting(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_override_to_active_requires_owner() {
        let (store, queue, machine) = seeded().await;
        let task = Task::new(queue.id.clone(), "clip.mp4", 1, Utc::now());
        store.insert_task(&task).await.unwrap();

        let refused = store
            .override_status(&queue.id, &task.id, TaskStatus::Converting, Utc::now())
            .await
            .unwrap();
        assert_eq!(refused, OverrideOutcome::Unowned);
        let unchanged = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Waiting);

        store.claim_task(&task.id, &machine.id, Utc::now()).await.unwrap();
        let applied = store
            .override_status(&queue.id, &task.id, TaskStatus::Uploading, Utc::now())
            .await
            .unwrap();
        assert!(matches!(applied, OverrideOutcome::Applied(ref t)
            if t.status == TaskStatus::Uploading && t.is_owned_by(&machine.id)));

        let failed = store
            .override_status(&queue.id, &task.id, TaskStatus::Failed, Utc::now())
            .await
            .unwrap();
        assert!(matches!(failed, OverrideOutcome::Applied(ref t) if t.status == TaskStatus::Failed));
    }
}
