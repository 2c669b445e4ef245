//! Client API tokens.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credential issued to dashboard and API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiToken {
    pub token: String,
    /// Clients may not enqueue tasks above this priority
    pub max_priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    /// Issue a new token with a random secret.
    pub fn issue(max_priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            token: generate_secret(),
            max_priority,
            created_at: now,
        }
    }

    /// Whether this token may enqueue at `priority`.
    pub fn permits(&self, priority: i32) -> bool {
        priority <= self.max_priority
    }
}

/// Generate an opaque bearer secret.
pub fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}
