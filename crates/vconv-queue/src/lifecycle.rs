//! Owner-driven task transitions.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vconv_models::{MachineId, Stage, Task, TaskId, TerminalOutcome};
use vconv_store::{Store, TransitionOutcome};

use crate::clock::Clock;
use crate::error::{CoordResult, CoordinatorError};
use crate::metrics;

/// Stage reports and terminal transitions issued by the owning machine.
///
/// Stage reports overwrite the stage payload; replays are accepted as-is.
/// Terminal transitions succeed at most once per task.
#[derive(Clone)]
pub struct TaskLifecycle {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn report_download(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        download_info: serde_json::Value,
    ) -> CoordResult<Task> {
        self.report(Stage::Download, task_id, machine, download_info).await
    }

    pub async fn report_convert(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        convert_info: serde_json::Value,
    ) -> CoordResult<Task> {
        self.report(Stage::Convert, task_id, machine, convert_info).await
    }

    pub async fn report_upload(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        upload_info: serde_json::Value,
    ) -> CoordResult<Task> {
        self.report(Stage::Upload, task_id, machine, upload_info).await
    }

    /// Record a stage payload and move the task into that stage.
    pub async fn report(
        &self,
        stage: Stage,
        task_id: &TaskId,
        machine: &MachineId,
        payload: serde_json::Value,
    ) -> CoordResult<Task> {
        let outcome = self
            .store
            .record_progress(task_id, machine, stage, payload, self.clock.now())
            .await?;
        let task = Self::applied(outcome, task_id, machine)?;
        debug!(task_id = %task_id, machine_id = %machine, %stage, "Stage reported");
        Ok(task)
    }

    /// FINISHED with `result`; credits the machine's success counter.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        result: serde_json::Value,
    ) -> CoordResult<Task> {
        let task = self
            .terminate(task_id, machine, TerminalOutcome::Finished(result))
            .await?;
        metrics::record_task_finished();
        info!(task_id = %task_id, machine_id = %machine, "Task finished");
        Ok(task)
    }

    /// FAILED with `error`; credits the machine's failure counter.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        error: impl Into<String>,
    ) -> CoordResult<Task> {
        let error = error.into();
        let task = self
            .terminate(task_id, machine, TerminalOutcome::Failed(error.clone()))
            .await?;
        metrics::record_task_failed();
        warn!(task_id = %task_id, machine_id = %machine, error = %error, "Task failed");
        Ok(task)
    }

    async fn terminate(
        &self,
        task_id: &TaskId,
        machine: &MachineId,
        outcome: TerminalOutcome,
    ) -> CoordResult<Task> {
        let outcome = self
            .store
            .finish_task(task_id, machine, outcome, self.clock.now())
            .await?;
        Self::applied(outcome, task_id, machine)
    }

    fn applied(outcome: TransitionOutcome, task_id: &TaskId, machine: &MachineId) -> CoordResult<Task> {
        match outcome {
            TransitionOutcome::Applied(task) => Ok(task),
            TransitionOutcome::NotFound => Err(CoordinatorError::not_found("Task", task_id)),
            TransitionOutcome::NotOwner => {
                warn!(task_id = %task_id, machine_id = %machine, "Rejected report from non-owner");
                Err(CoordinatorError::not_owner(task_id))
            }
            TransitionOutcome::AlreadyTerminal(status) => Err(CoordinatorError::conflict(format!(
                "Task {} is already {}",
                task_id, status
            ))),
        }
    }
}
