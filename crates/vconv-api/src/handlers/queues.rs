//! Client-facing queue and task administration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use vconv_models::{Queue, QueueId, Task, TaskId, TaskStats, TaskStatus};

use crate::auth::ClientAuth;
use crate::error::{ApiError, ApiResult};
use crate::extract::ApiJson;
use crate::security::{sanitize_name, validate_id};
use crate::state::AppState;

#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: Vec<Queue>,
}

#[derive(Serialize)]
pub struct QueueResponse {
    pub queue: Queue,
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<Task>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub task: Task,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn queue_id(raw: String) -> ApiResult<QueueId> {
    validate_id("queue", &raw)?;
    Ok(QueueId::from(raw))
}

fn task_id(raw: String) -> ApiResult<TaskId> {
    validate_id("task", &raw)?;
    Ok(TaskId::from(raw))
}

pub async fn list_queues(
    State(state): State<AppState>,
    _auth: ClientAuth,
) -> ApiResult<Json<QueuesResponse>> {
    let queues = state.core.queues.list_queues().await?;
    Ok(Json(QueuesResponse { queues }))
}

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub name: String,
}

pub async fn create_queue(
    State(state): State<AppState>,
    _auth: ClientAuth,
    ApiJson(request): ApiJson<CreateQueueRequest>,
) -> ApiResult<(StatusCode, Json<QueueResponse>)> {
    let name = sanitize_name("name", &request.name)?;
    let queue = state.core.queues.create_queue(&name).await?;
    Ok((StatusCode::CREATED, Json(QueueResponse { queue })))
}

pub async fn get_queue(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<QueueResponse>> {
    let queue = state.core.queues.get_queue(&queue_id(id)?).await?;
    Ok(Json(QueueResponse { queue }))
}

/// Delete an empty queue.
pub async fn delete_queue(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    let id = queue_id(id)?;
    state.core.queues.delete_queue(&id).await?;
    Ok(Json(MessageResponse {
        message: format!("Queue {} deleted", id),
    }))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path(id): Path<String>,
) -> ApiResult<Json<TasksResponse>> {
    let tasks = state.core.queues.list_tasks(&queue_id(id)?).await?;
    Ok(Json(TasksResponse { tasks }))
}

#[derive(Debug, Deserialize)]
pub struct EnqueueTaskRequest {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
}

/// Enqueue a task. The priority may not exceed the caller's token ceiling.
pub async fn enqueue_task(
    State(state): State<AppState>,
    ClientAuth(token): ClientAuth,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<EnqueueTaskRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let name = sanitize_name("name", &request.name)?;
    let task = state
        .core
        .queues
        .enqueue(&queue_id(id)?, &name, request.priority, &token)
        .await?;
    Ok(Json(TaskResponse { task }))
}

pub async fn delete_task(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path((queue, task)): Path<(String, String)>,
) -> ApiResult<Json<MessageResponse>> {
    let task = task_id(task)?;
    state.core.queues.delete_task(&queue_id(queue)?, &task).await?;
    Ok(Json(MessageResponse {
        message: format!("Task {} deleted", task),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// Administrative status override.
pub async fn update_task_status(
    State(state): State<AppState>,
    _auth: ClientAuth,
    Path((queue, task)): Path<(String, String)>,
    ApiJson(request): ApiJson<UpdateStatusRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let status: TaskStatus = request
        .status
        .parse()
        .map_err(|e: vconv_models::ParseStatusError| ApiError::Validation(e.to_string()))?;
    let task = state
        .core
        .queues
        .override_status(&queue_id(queue)?, &task_id(task)?, status)
        .await?;
    Ok(Json(TaskResponse { task }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatsResponse {
    pub task_stats: TaskStats,
}

/// Global task-status histogram.
pub async fn task_stats(
    State(state): State<AppState>,
    _auth: ClientAuth,
) -> ApiResult<Json<TaskStatsResponse>> {
    let task_stats = state.core.fleet.task_stats().await?;
    Ok(Json(TaskStatsResponse { task_stats }))
}
