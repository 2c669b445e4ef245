//! API routes.

use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::machines::{
    create_machine, delete_machine, list_machines, machine_details, machine_stats,
};
use crate::handlers::queues::{
    create_queue, delete_queue, delete_task, enqueue_task, get_queue, list_queues, list_tasks,
    task_stats, update_task_status,
};
use crate::handlers::runner::{
    complete_task, fail_task, get_runner, get_task, heartbeat, list_queue, online,
    report_convert, report_download, report_upload, start_task,
};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, rate_limit_middleware, request_id, request_logging, security_headers,
    ClientRateLimiter,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    // Machine-authenticated worker routes
    let runner_routes = Router::new()
        .route("/runner", get(get_runner))
        .route("/runner/listQueue", get(list_queue))
        .route("/runner/getTask", get(get_task))
        .route("/runner/online", post(online))
        .route("/runner/heartbeat", post(heartbeat))
        .route("/runner/:task_id/start", post(start_task))
        .route("/runner/:task_id/download", post(report_download))
        .route("/runner/:task_id/convert", post(report_convert))
        .route("/runner/:task_id/upload", post(report_upload))
        .route("/runner/:task_id/complete", post(complete_task))
        .route("/runner/:task_id/fail", post(fail_task));

    let queue_routes = Router::new()
        .route("/queue", get(list_queues).post(create_queue))
        .route("/queue/:queue_id", get(get_queue).delete(delete_queue))
        .route("/queue/:queue_id/tasks", get(list_tasks))
        .route("/queue/:queue_id/task/new", post(enqueue_task))
        .route("/queue/:queue_id/task/:task_id", delete(delete_task))
        .route("/queue/:queue_id/task/:task_id/status", patch(update_task_status))
        .route("/stats/tasks", get(task_stats));

    let machine_routes = Router::new()
        .route("/machine", get(list_machines).post(create_machine))
        .route("/machine/:machine_id", delete(delete_machine))
        .route("/machine/:machine_id/details", get(machine_details))
        .route("/machine/:machine_id/stats", get(machine_stats));

    // Client routes are rate limited per IP
    let rate_limiter = ClientRateLimiter::new(state.config.rate_limit_rps);
    let client_routes = Router::new()
        .merge(queue_routes)
        .merge(machine_routes)
        .layer(middleware::from_fn_with_state(rate_limiter, rate_limit_middleware));

    let api_routes = Router::new().merge(runner_routes).merge(client_routes);

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    let metrics_routes = match metrics_handle {
        Some(handle) => Router::new().route("/metrics", get(move || async move { handle.render() })),
        None => Router::new(),
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_logging))
        .layer(middleware::from_fn(request_id))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
