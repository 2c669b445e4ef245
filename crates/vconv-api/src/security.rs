//! Input validation for path ids and names.

use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::{ApiError, ApiResult};

/// Maximum length of a queue, task or machine name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of an id taken from the path.
const MAX_ID_LENGTH: usize = 128;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid id pattern"));

/// Reject ids that could never have been generated by the coordinator.
pub fn validate_id(kind: &str, raw: &str) -> ApiResult<()> {
    if raw.is_empty() || raw.len() > MAX_ID_LENGTH || !ID_PATTERN.is_match(raw) {
        return Err(ApiError::Validation(format!("Invalid {} id", kind)));
    }
    Ok(())
}

/// Trim a user-supplied name and check its length and characters.
pub fn sanitize_name(field: &str, raw: &str) -> ApiResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ApiError::Validation(format!(
            "{} must be at most {} characters",
            field, MAX_NAME_LENGTH
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ApiError::Validation(format!("{} contains control characters", field)));
    }
    Ok(name.to_string())
}
