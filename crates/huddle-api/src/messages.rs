use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use huddle_types::api::{Claims, ErrorResponse, MessageHistoryResponse};
use huddle_types::error::ChatError;
use huddle_types::models::Message;

use crate::auth::AppState;
use crate::run_blocking;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass `next_before` from the previous page
    /// to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

/// Newest-first history page for a channel. Requires membership; the
/// real-time gateway is the delivery path for anything newer than the page.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let db = state.db.clone();
    let limit = query.limit.min(200);
    let before = query.before;

    let (messages, next_before) = run_blocking(move || {
        if !registry.is_member(channel_id, claims.sub)? {
            return Err(ChatError::forbidden("not a member of this channel"));
        }

        let rows = db.list_messages(&channel_id.to_string(), limit, before.as_deref())?;

        // Cursor is the raw stored timestamp of the oldest row on a full
        // page, so it compares exactly against what SQLite holds.
        let next_before = if rows.len() as u32 == limit {
            rows.last().map(|row| row.created_at.clone())
        } else {
            None
        };

        let messages = rows
            .into_iter()
            .map(Message::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((messages, next_before))
    })
    .await?;

    Ok(Json(MessageHistoryResponse {
        messages,
        next_before,
    }))
}
