//! First-start initialization.

use tracing::info;

use vconv_models::ApiToken;
use vconv_store::{Store, StoreResult};

/// Issue an initial client token when none exist.
///
/// Returns the new token, or `None` if tokens were already present.
pub async fn ensure_initial_token(
    store: &dyn Store,
    max_priority: i32,
    now: chrono::DateTime<chrono::Utc>,
) -> StoreResult<Option<ApiToken>> {
    if store.count_tokens().await? > 0 {
        return Ok(None);
    }

    let token = ApiToken::issue(max_priority, now);
    store.create_token(&token).await?;
    info!(
        max_priority,
        token = %token.token,
        "No API tokens found, issued an initial token"
    );
    Ok(Some(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vconv_store::InMemoryStore;

    #[tokio::test]
    async fn test_bootstrap_runs_once() {
        let store = InMemoryStore::new();
        let first = ensure_initial_token(&store, 100, Utc::now()).await.unwrap();
        assert_eq!(first.as_ref().map(|t| t.max_priority), Some(100));

        let second = ensure_initial_token(&store, 100, Utc::now()).await.unwrap();
        assert!(second.is_none());
        assert_eq!(store.count_tokens().await.unwrap(), 1);
    }
}
