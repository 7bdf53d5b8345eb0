use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use huddle_types::api::{Claims, CreateChannelRequest, ErrorResponse, JoinChannelResponse};

use crate::auth::AppState;
use crate::run_blocking;

/// Directory of every channel, annotated with membership and member count
/// so clients can offer discover-and-join.
pub async fn list_channels(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let overviews = run_blocking(move || registry.list_for(claims.sub)).await?;
    Ok(Json(overviews))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let channel = run_blocking(move || {
        registry.create(&req.name, req.kind, &req.description, claims.sub)
    })
    .await?;

    info!(
        "{} ({}) created channel '{}'",
        claims.username, claims.sub, channel.name
    );
    Ok((StatusCode::CREATED, Json(channel)))
}

/// Explicit join by channel id. Idempotent: re-joining returns the existing
/// membership with the original joined_at.
pub async fn join_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let registry = state.registry.clone();
    let membership = run_blocking(move || registry.join(channel_id, claims.sub)).await?;

    Ok(Json(JoinChannelResponse {
        channel_id: membership.channel_id,
        user_id: membership.user_id,
        joined_at: membership.joined_at,
    }))
}
