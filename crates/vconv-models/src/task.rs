//! Task definitions and the task status state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::{MachineId, QueueId, TaskId};

/// Task processing status.
///
/// ```text
/// WAITING -> DOWNLOADING -> CONVERTING -> UPLOADING -> FINISHED | FAILED
/// ```
///
/// WAITING is the only entry state. FINISHED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Enqueued, waiting for a machine to claim it
    #[default]
    Waiting,
    /// Claimed; the machine is fetching the source
    Downloading,
    /// The machine is transcoding
    Converting,
    /// The machine is uploading the output
    Uploading,
    /// Completed with a result payload
    Finished,
    /// Failed with an error message
    Failed,
}

impl TaskStatus {
    /// Every status, in pipeline order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Waiting,
        TaskStatus::Downloading,
        TaskStatus::Converting,
        TaskStatus::Uploading,
        TaskStatus::Finished,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Downloading => "DOWNLOADING",
            TaskStatus::Converting => "CONVERTING",
            TaskStatus::Uploading => "UPLOADING",
            TaskStatus::Finished => "FINISHED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Check if this is a terminal state (no transition leaves it).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }

    /// Check if a machine is actively working the task.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Downloading | TaskStatus::Converting | TaskStatus::Uploading
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, Error)]
#[error("Unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// A non-terminal pipeline stage reported by the owning machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Convert,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Convert => "convert",
            Stage::Upload => "upload",
        }
    }

    /// Wire name of the payload field this stage writes.
    pub fn payload_field(&self) -> &'static str {
        match self {
            Stage::Download => "downloadInfo",
            Stage::Convert => "convertInfo",
            Stage::Upload => "uploadInfo",
        }
    }

    /// Status the task enters when this stage is reported.
    pub fn target_status(&self) -> TaskStatus {
        match self {
            Stage::Download => TaskStatus::Downloading,
            Stage::Convert => TaskStatus::Converting,
            Stage::Upload => TaskStatus::Uploading,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a terminal transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    /// Task finished with a producer-defined result payload
    Finished(serde_json::Value),
    /// Task failed with an error message
    Failed(String),
}

impl TerminalOutcome {
    /// Status the task ends in.
    pub fn status(&self) -> TaskStatus {
        match self {
            TerminalOutcome::Finished(_) => TaskStatus::Finished,
            TerminalOutcome::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// A unit of video-conversion work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Higher is more urgent
    pub priority: i32,
    /// Owning queue, immutable
    pub queue_id: QueueId,
    /// Set on claim
    pub machine_id: Option<MachineId>,
    pub download_info: Option<serde_json::Value>,
    pub convert_info: Option<serde_json::Value>,
    pub upload_info: Option<serde_json::Value>,
    /// Set on FINISHED
    pub result: Option<serde_json::Value>,
    /// Set on FAILED
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new WAITING task.
    pub fn new(queue_id: QueueId, name: impl Into<String>, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            status: TaskStatus::Waiting,
            priority,
            queue_id,
            machine_id: None,
            download_info: None,
            convert_info: None,
            upload_info: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `machine` currently holds this task.
    pub fn is_owned_by(&self, machine: &MachineId) -> bool {
        self.machine_id.as_ref() == Some(machine)
    }

    /// Dispatch ordering: priority desc, then createdAt asc, then id asc.
    pub fn dispatch_order(&self, other: &Task) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Hand the task to a machine. Caller has checked the task is WAITING.
    pub fn claim(&mut self, machine: &MachineId, now: DateTime<Utc>) {
        self.status = TaskStatus::Downloading;
        self.machine_id = Some(machine.clone());
        self.updated_at = now;
    }

    /// Overwrite a stage payload and enter that stage's status.
    pub fn apply_progress(&mut self, stage: Stage, payload: serde_json::Value, now: DateTime<Utc>) {
        match stage {
            Stage::Download => self.download_info = Some(payload),
            Stage::Convert => self.convert_info = Some(payload),
            Stage::Upload => self.upload_info = Some(payload),
        }
        self.status = stage.target_status();
        self.updated_at = now;
    }

    /// Move the task into its terminal state.
    pub fn apply_terminal(&mut self, outcome: &TerminalOutcome, now: DateTime<Utc>) {
        match outcome {
            TerminalOutcome::Finished(result) => self.result = Some(result.clone()),
            TerminalOutcome::Failed(error) => self.error = Some(error.clone()),
        }
        self.status = outcome.status();
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&TaskStatus::Downloading).unwrap(), "\"DOWNLOADING\"");
        let parsed: TaskStatus = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, TaskStatus::Failed);
        assert_eq!("uploading".parse::<TaskStatus>().unwrap(), TaskStatus::Uploading);
        assert!("PAUSED".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_classes() {
        for status in TaskStatus::ALL {
            assert!(!(status.is_terminal() && status.is_active()));
        }
        assert!(TaskStatus::Converting.is_active());
        assert!(!TaskStatus::Waiting.is_active());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_task_is_waiting_and_unowned() {
        let task = Task::new(QueueId::from("q"), "clip.mp4", 7, Utc::now());
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.priority, 7);
        assert!(task.machine_id.is_none());

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["queueId"], "q");
        assert_eq!(value["machineId"], serde_json::Value::Null);
        assert_eq!(value["status"], "WAITING");
    }

    #[test]
    fn test_dispatch_order() {
        let t0 = Utc::now();
        let q = QueueId::from("q");
        let early = Task::new(q.clone(), "a", 5, t0);
        let late = Task::new(q.clone(), "b", 5, t0 + Duration::seconds(1));
        let urgent = Task::new(q, "c", 10, t0 + Duration::seconds(2));

        let mut tasks = vec![late.clone(), urgent.clone(), early.clone()];
        tasks.sort_by(|a, b| a.dispatch_order(b));
        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn test_progress_and_terminal() {
        let now = Utc::now();
        let machine = MachineId::from("m1");
        let mut task = Task::new(QueueId::from("q"), "clip.mp4", 1, now);
        task.claim(&machine, now);
        assert!(task.is_owned_by(&machine));

        task.apply_progress(Stage::Convert, json!({"percent": 40}), now);
        assert_eq!(task.status, TaskStatus::Converting);
        assert_eq!(task.convert_info, Some(json!({"percent": 40})));

        task.apply_terminal(&TerminalOutcome::Failed("ffmpeg exited 1".into()), now);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("ffmpeg exited 1"));
        assert!(task.is_terminal());
    }
}
