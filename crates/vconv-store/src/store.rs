//! The durable store abstraction.
//!
//! All shared state lives behind [`Store`]. Components never hold in-process
//! locks of their own: any mutation whose validity depends on current state
//! (claim, stage report, terminal transition, first-heartbeat stamp) is a
//! single conditional operation of the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vconv_models::{
    ApiToken, Machine, MachineId, Queue, QueueId, Stage, Task, TaskId, TaskStatus, TerminalOutcome,
};

use crate::error::StoreResult;

/// Result of a conditional claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The task was WAITING and now belongs to the caller.
    Claimed(Task),
    /// The task exists but was not WAITING at commit time.
    NotWaiting(TaskStatus),
    /// No such task.
    NotFound,
}

/// Result of an owner-checked transition (stage report or terminal).
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The transition was applied; carries the updated task.
    Applied(Task),
    /// No such task.
    NotFound,
    /// The task is not held by the calling machine. Nothing was written.
    NotOwner,
    /// The task is already FINISHED or FAILED. Nothing was written.
    AlreadyTerminal(TaskStatus),
}

/// Result of an administrative status override.
#[derive(Debug, Clone, PartialEq)]
pub enum OverrideOutcome {
    /// The status was set; carries the updated task.
    Applied(Task),
    /// No such task in that queue.
    NotFound,
    /// An active status was requested for a task no machine holds.
    /// Nothing was written.
    Unowned,
}

/// Result of a delete that can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The queue still holds tasks.
    NotEmpty,
}

/// Storage abstraction for coordinator state.
///
/// ## Atomicity
///
/// - `claim_task` succeeds only if the task is WAITING at commit time, so of
///   any number of concurrent claimers exactly one wins.
/// - `record_progress` and `finish_task` check ownership and non-terminal
///   status in the same step that writes.
/// - `finish_task` writes the task and increments the owning machine's
///   success/failure counter together, or writes nothing.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Queues ---

    /// Create a queue. Fails with `Duplicate` if the name is taken.
    async fn create_queue(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Queue>;

    /// All queues, oldest first.
    async fn list_queues(&self) -> StoreResult<Vec<Queue>>;

    async fn get_queue(&self, id: &QueueId) -> StoreResult<Option<Queue>>;

    /// Delete a queue. Refused while it still holds tasks.
    async fn delete_queue(&self, id: &QueueId) -> StoreResult<DeleteOutcome>;

    // --- Tasks ---

    /// Insert a task into its queue. Returns false, writing nothing, if the
    /// queue does not exist at commit time.
    async fn insert_task(&self, task: &Task) -> StoreResult<bool>;

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>>;

    /// Tasks of one queue, oldest first.
    async fn list_tasks(&self, queue: &QueueId) -> StoreResult<Vec<Task>>;

    /// Delete a task of `queue`. Returns false if no such task is in that queue.
    async fn delete_task(&self, queue: &QueueId, id: &TaskId) -> StoreResult<bool>;

    /// Best WAITING candidate: priority desc, createdAt asc, id asc.
    ///
    /// This is a read. The candidate may be claimed by someone else before
    /// the caller's `claim_task` commits.
    async fn peek_waiting(&self, queue: Option<&QueueId>) -> StoreResult<Option<Task>>;

    /// Claim a task for `machine` iff it is WAITING.
    async fn claim_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome>;

    /// Overwrite a stage payload and enter that stage's status.
    async fn record_progress(
        &self,
        id: &TaskId,
        machine: &MachineId,
        stage: Stage,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome>;

    /// Move a task to FINISHED/FAILED and bump the machine's counter.
    async fn finish_task(
        &self,
        id: &TaskId,
        machine: &MachineId,
        outcome: TerminalOutcome,
        now: DateTime<Utc>,
    ) -> StoreResult<TransitionOutcome>;

    /// Administrative status override, bypassing the state machine.
    ///
    /// Setting WAITING releases the task from its machine so it can be
    /// dispatched again. An active status is refused unless a machine holds
    /// the task. Counters are never touched.
    async fn override_status(
        &self,
        queue: &QueueId,
        id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<OverrideOutcome>;

    /// Per-status task counts, optionally only tasks held by `machine`.
    async fn task_status_counts(
        &self,
        machine: Option<&MachineId>,
    ) -> StoreResult<Vec<(TaskStatus, u64)>>;

    // --- Machines ---

    /// Register a machine. Fails with `Duplicate` if name, ip or token is taken.
    async fn create_machine(&self, machine: &Machine) -> StoreResult<()>;

    /// All machines ordered by name.
    async fn list_machines(&self) -> StoreResult<Vec<Machine>>;

    async fn get_machine(&self, id: &MachineId) -> StoreResult<Option<Machine>>;

    async fn find_machine_by_token(&self, token: &str) -> StoreResult<Option<Machine>>;

    async fn delete_machine(&self, id: &MachineId) -> StoreResult<bool>;

    /// Stamp the heartbeat (and first heartbeat, once) with the reported info.
    async fn record_heartbeat(
        &self,
        id: &MachineId,
        device_info: serde_json::Value,
        encoder: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Machine>>;

    /// Stamp `first_heartbeat` if unset.
    async fn mark_online(&self, id: &MachineId, now: DateTime<Utc>) -> StoreResult<Option<Machine>>;

    // --- Tokens ---

    async fn create_token(&self, token: &ApiToken) -> StoreResult<()>;

    async fn find_token(&self, token: &str) -> StoreResult<Option<ApiToken>>;

    async fn count_tokens(&self) -> StoreResult<u64>;

    // --- Health ---

    /// Round-trip to the backend.
    async fn ping(&self) -> StoreResult<()>;
}

