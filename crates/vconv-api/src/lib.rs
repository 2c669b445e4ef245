//! Axum HTTP API for the vconv coordinator.
//!
//! This crate provides:
//! - Machine-facing runner routes (claim, stage reports, heartbeats)
//! - Client-facing queue, task and machine administration
//! - Bearer-token authentication for both principals
//! - Rate limiting, security headers and Prometheus metrics

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod security;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
