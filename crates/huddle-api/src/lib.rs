pub mod auth;
pub mod channels;
pub mod messages;
pub mod middleware;

use axum::Json;
use axum::http::StatusCode;

use huddle_types::api::ErrorResponse;
use huddle_types::error::ChatError;

/// Map a domain error to the conventional REST envelope.
pub(crate) fn error_response(err: ChatError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, message) = match &err {
        ChatError::AuthenticationFailure => (StatusCode::UNAUTHORIZED, err.to_string()),
        ChatError::Forbidden(_) => (StatusCode::FORBIDDEN, err.to_string()),
        ChatError::InvalidInput(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        ChatError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        ChatError::Storage(inner) => {
            tracing::error!("storage error: {:#}", inner);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        }
    };
    (status, Json(ErrorResponse { error: message }))
}

/// spawn_blocking wrapper for the rusqlite-backed registry/store calls.
pub(crate) async fn run_blocking<T>(
    f: impl FnOnce() -> Result<T, ChatError> + Send + 'static,
) -> Result<T, (StatusCode, Json<ErrorResponse>)>
where
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(error_response),
        Err(e) => {
            tracing::error!("spawn_blocking join error: {}", e);
            Err(error_response(ChatError::Storage(anyhow::anyhow!(
                "blocking task failed"
            ))))
        }
    }
}
