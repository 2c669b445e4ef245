//! Bearer-token authentication for machines and clients.
//!
//! Handlers declare which principal they need by taking [`MachineAuth`] or
//! [`ClientAuth`] as an argument.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::{debug, warn};

use vconv_models::{ApiToken, Machine};

use crate::error::ApiError;
use crate::state::AppState;

/// A worker machine authenticated by its machine token.
#[derive(Debug, Clone)]
pub struct MachineAuth(pub Machine);

/// An API client authenticated by an issued token.
#[derive(Debug, Clone)]
pub struct ClientAuth(pub ApiToken);

/// Extract the bearer token from the Authorization header.
fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    let header = parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

    if token.is_empty() {
        return Err(ApiError::unauthorized("Empty bearer token"));
    }
    Ok(token)
}

#[async_trait]
impl FromRequestParts<AppState> for MachineAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        match state.store.find_machine_by_token(token).await? {
            Some(machine) => {
                debug!(machine_id = %machine.id, "Machine authenticated");
                Ok(MachineAuth(machine))
            }
            None => {
                warn!(path = %parts.uri.path(), "Unknown machine token");
                Err(ApiError::unauthorized("Invalid machine token"))
            }
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for ClientAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        match state.store.find_token(token).await? {
            Some(token) => Ok(ClientAuth(token)),
            None => {
                warn!(path = %parts.uri.path(), "Unknown client token");
                Err(ApiError::forbidden("Invalid API token"))
            }
        }
    }
}
