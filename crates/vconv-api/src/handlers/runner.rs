//! Worker-facing handlers. Every route authenticates a machine.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use vconv_models::{MachineId, MachineSummary, Queue, QueueId, Stage, Task, TaskId};

use crate::auth::MachineAuth;
use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiQuery};
use crate::security::validate_id;
use crate::state::AppState;

const NO_TASK_AVAILABLE: &str = "No task available";

#[derive(Serialize)]
pub struct RunnerIdentity {
    pub id: MachineId,
    pub name: String,
}

#[derive(Serialize)]
pub struct RunnerIdentityResponse {
    pub runner: RunnerIdentity,
}

/// Identify the calling machine.
pub async fn get_runner(MachineAuth(machine): MachineAuth) -> Json<RunnerIdentityResponse> {
    Json(RunnerIdentityResponse {
        runner: RunnerIdentity {
            id: machine.id,
            name: machine.name,
        },
    })
}

#[derive(Serialize)]
pub struct RunnerQueuesResponse {
    pub queue: Vec<Queue>,
}

pub async fn list_queue(
    State(state): State<AppState>,
    _auth: MachineAuth,
) -> ApiResult<Json<RunnerQueuesResponse>> {
    let queue = state.core.queues.list_queues().await?;
    Ok(Json(RunnerQueuesResponse { queue }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTaskQuery {
    pub queue_id: Option<String>,
}

/// Either the claimed task or a "nothing to do" message.
#[derive(Serialize)]
#[serde(untagged)]
pub enum NextTaskResponse {
    Task { task: Task },
    Empty { message: &'static str },
}

/// Claim the best waiting task, optionally from one queue.
pub async fn get_task(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    ApiQuery(query): ApiQuery<NextTaskQuery>,
) -> ApiResult<Json<NextTaskResponse>> {
    let queue = match query.queue_id.filter(|q| !q.is_empty()) {
        Some(raw) => {
            validate_id("queue", &raw)?;
            Some(QueueId::from(raw))
        }
        None => None,
    };

    let claimed = state
        .core
        .dispatcher
        .next_task(&machine.id, queue.as_ref())
        .await?;

    Ok(Json(match claimed {
        Some(task) => NextTaskResponse::Task { task },
        None => NextTaskResponse::Empty {
            message: NO_TASK_AVAILABLE,
        },
    }))
}

#[derive(Serialize)]
pub struct StartTaskResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

/// Claim a specific task by id.
pub async fn start_task(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
) -> ApiResult<Json<StartTaskResponse>> {
    validate_id("task", &task_id)?;
    let task_id = TaskId::from(task_id);

    let response = match state.core.dispatcher.claim(&task_id, &machine.id).await? {
        Some(task) => StartTaskResponse {
            success: true,
            task: Some(task),
            message: None,
        },
        None => StartTaskResponse {
            success: false,
            task: None,
            message: Some(NO_TASK_AVAILABLE),
        },
    };
    Ok(Json(response))
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Pull a required key out of a progress body. `null` is an accepted value.
fn required_field(body: &mut Map<String, Value>, key: &str) -> ApiResult<Value> {
    body.remove(key)
        .ok_or_else(|| ApiError::bad_request(format!("Missing {}", key)))
}

async fn report_stage(
    state: AppState,
    machine: MachineId,
    task_id: String,
    stage: Stage,
    mut body: Map<String, Value>,
) -> ApiResult<Json<SuccessResponse>> {
    validate_id("task", &task_id)?;
    let payload = required_field(&mut body, stage.payload_field())?;
    state
        .core
        .lifecycle
        .report(stage, &TaskId::from(task_id), &machine, payload)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn report_download(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<SuccessResponse>> {
    report_stage(state, machine.id, task_id, Stage::Download, body).await
}

pub async fn report_convert(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<SuccessResponse>> {
    report_stage(state, machine.id, task_id, Stage::Convert, body).await
}

pub async fn report_upload(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
    ApiJson(body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<SuccessResponse>> {
    report_stage(state, machine.id, task_id, Stage::Upload, body).await
}

/// Finish an owned task with its result payload.
pub async fn complete_task(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
    ApiJson(mut body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<SuccessResponse>> {
    validate_id("task", &task_id)?;
    let result = required_field(&mut body, "result")?;
    state
        .core
        .lifecycle
        .complete(&TaskId::from(task_id), &machine.id, result)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Fail an owned task. Non-string error payloads are stored as JSON text.
pub async fn fail_task(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    Path(task_id): Path<String>,
    ApiJson(mut body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<SuccessResponse>> {
    validate_id("task", &task_id)?;
    let error = match required_field(&mut body, "error")? {
        Value::String(message) => message,
        other => other.to_string(),
    };
    state
        .core
        .lifecycle
        .fail(&TaskId::from(task_id), &machine.id, error)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Serialize)]
pub struct RunnerResponse {
    pub runner: MachineSummary,
}

/// Announce the machine. Only the first call stamps its first heartbeat.
pub async fn online(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
) -> ApiResult<Json<RunnerResponse>> {
    let updated = state.core.fleet.mark_online(&machine.id).await?;
    Ok(Json(RunnerResponse {
        runner: MachineSummary::project(&updated, state.clock.now()),
    }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    MachineAuth(machine): MachineAuth,
    ApiJson(mut body): ApiJson<Map<String, Value>>,
) -> ApiResult<Json<RunnerResponse>> {
    let device_info = body
        .remove("deviceInfo")
        .ok_or_else(|| ApiError::bad_request("Missing deviceInfo"))?;
    let encoder = match body.remove("encoder") {
        Some(Value::String(encoder)) => encoder,
        Some(_) => return Err(ApiError::bad_request("encoder must be a string")),
        None => return Err(ApiError::bad_request("Missing encoder")),
    };

    let first_seen = machine.first_heartbeat.is_none();
    let updated = state
        .core
        .fleet
        .heartbeat(&machine.id, device_info, &encoder)
        .await?;
    if first_seen {
        info!(machine_id = %updated.id, encoder = %encoder, "First heartbeat received");
    }

    Ok(Json(RunnerResponse {
        runner: MachineSummary::project(&updated, state.clock.now()),
    }))
}
